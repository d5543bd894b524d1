//! 内容处理链路集成测试
//!
//! 渲染 → 净化的组合行为：模板变量替换后的内容再经白名单净化，
//! 恶意标记不会借助模板变量绕过净化。

use std::collections::HashMap;

use uuid::Uuid;

use notify_notification_worker::recipients::Recipient;
use notify_notification_worker::sanitize::sanitize_html;
use notify_notification_worker::template;

fn recipient() -> Recipient {
    Recipient {
        id: Uuid::now_v7(),
        name: Some("李雷".to_string()),
        email: Some("lilei@example.com".to_string()),
        phone: Some("+8613800138000".to_string()),
    }
}

#[test]
fn test_render_then_sanitize_keeps_safe_markup() {
    let rendered = template::render(
        "<p>你好 {{name}}，<a href=\"https://example.com\">查看详情</a></p>",
        &recipient(),
        &HashMap::new(),
    );
    let clean = sanitize_html(&rendered);

    assert!(clean.contains("你好 李雷"));
    assert!(clean.contains("<a"));
    assert!(clean.contains("<p>"));
}

#[test]
fn test_malicious_variable_cannot_smuggle_script() {
    let mut vars = HashMap::new();
    vars.insert(
        "promo".to_string(),
        "<script>alert(1)</script><img src=x onerror=alert(2)>".to_string(),
    );

    let rendered = template::render("本周优惠：{{promo}}", &recipient(), &vars);
    let clean = sanitize_html(&rendered);

    assert!(!clean.contains("<script"));
    assert!(!clean.contains("onerror"));
}

#[test]
fn test_caller_vars_shadow_recipient_defaults() {
    let mut vars = HashMap::new();
    vars.insert("name".to_string(), "尊贵的会员".to_string());

    let rendered = template::render("{{name}}（{{email}}）", &recipient(), &vars);
    assert_eq!(rendered, "尊贵的会员（lilei@example.com）");
}

#[test]
fn test_unknown_tokens_survive_verbatim() {
    let rendered = template::render("余额 {{balance}} 元", &recipient(), &HashMap::new());
    assert_eq!(rendered, "余额 {{balance}} 元");
}
