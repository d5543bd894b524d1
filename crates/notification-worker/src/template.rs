//! 通知模板渲染
//!
//! 轻量占位符替换：`{{key}}` 从变量表取值，未命中的占位符原样保留，
//! 便于在预览里暴露缺失变量而不是悄悄吞掉。

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::recipients::Recipient;

/// 收件人缺少姓名时 `{{name}}` 的替代文案
pub const DEFAULT_NAME: &str = "尊敬的用户";

static TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| {
    // 占位符固定为小写字母/数字/下划线，其余形式不视为占位符
    Regex::new(r"\{\{([a-z0-9_]+)\}\}").unwrap_or_else(|_| unreachable!())
});

/// 渲染模板
///
/// 变量优先级：调用方变量覆盖系统默认变量（name / email / id）。
/// 收件人姓名缺省时 name 落到 [`DEFAULT_NAME`]；邮箱缺省时 email 不注入，
/// 占位符按未解析处理原样保留。
pub fn render(template: &str, recipient: &Recipient, vars: &HashMap<String, String>) -> String {
    let mut merged: HashMap<&str, &str> = HashMap::new();
    merged.insert("name", recipient.name.as_deref().unwrap_or(DEFAULT_NAME));
    if let Some(email) = recipient.email.as_deref() {
        merged.insert("email", email);
    }
    let id = recipient.id.to_string();
    merged.insert("id", id.as_str());
    for (k, v) in vars {
        merged.insert(k.as_str(), v.as_str());
    }

    TOKEN_RE
        .replace_all(template, |caps: &regex::Captures<'_>| {
            let key = &caps[1];
            match merged.get(key) {
                Some(value) => (*value).to_string(),
                // 未解析的占位符原样保留
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn recipient() -> Recipient {
        Recipient {
            id: Uuid::now_v7(),
            name: Some("王小明".to_string()),
            email: Some("xiaoming@example.com".to_string()),
            phone: None,
        }
    }

    #[test]
    fn test_system_defaults_are_available() {
        let r = recipient();
        let out = render("你好 {{name}}（{{email}}）", &r, &HashMap::new());
        assert_eq!(out, "你好 王小明（xiaoming@example.com）");
    }

    #[test]
    fn test_caller_vars_override_defaults() {
        let r = recipient();
        let vars = HashMap::from([("name".to_string(), "尊敬的用户".to_string())]);
        let out = render("你好 {{name}}", &r, &vars);
        assert_eq!(out, "你好 尊敬的用户");
    }

    #[test]
    fn test_unresolved_tokens_stay_verbatim() {
        let r = recipient();
        let out = render("优惠码：{{coupon_code}}", &r, &HashMap::new());
        assert_eq!(out, "优惠码：{{coupon_code}}");
    }

    #[test]
    fn test_missing_name_falls_back_to_default() {
        let r = Recipient {
            id: Uuid::now_v7(),
            name: None,
            email: None,
            phone: Some("+8613800138000".to_string()),
        };
        let out = render("你好 {{name}}", &r, &HashMap::new());
        assert_eq!(out, format!("你好 {DEFAULT_NAME}"));
        // 邮箱缺省时 email 占位符按未解析处理
        assert_eq!(render("{{email}}", &r, &HashMap::new()), "{{email}}");
    }

    #[test]
    fn test_caller_vars_override_name_fallback() {
        let r = Recipient {
            id: Uuid::now_v7(),
            name: None,
            email: None,
            phone: None,
        };
        let vars = HashMap::from([("name".to_string(), "李会员".to_string())]);
        assert_eq!(render("你好 {{name}}", &r, &vars), "你好 李会员");
    }

    #[test]
    fn test_mixed_resolution() {
        let r = recipient();
        let vars = HashMap::from([("order_id".to_string(), "A-1024".to_string())]);
        let out = render("{{name}} 的订单 {{order_id}} 已发货，{{tracking}}", &r, &vars);
        assert_eq!(out, "王小明 的订单 A-1024 已发货，{{tracking}}");
    }
}
