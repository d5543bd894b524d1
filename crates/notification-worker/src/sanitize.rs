//! HTML 内容净化
//!
//! 所有渲染后的通知内容在落库与投递前统一过一遍净化，
//! 白名单只保留排版类标签，脚本与事件处理器一律剥离。

use std::collections::HashSet;
use std::sync::LazyLock;

use ammonia::Builder;

static SANITIZER: LazyLock<Builder<'static>> = LazyLock::new(|| {
    let mut builder = Builder::default();
    let tags: HashSet<&str> = [
        "a", "b", "i", "em", "strong", "u", "p", "br", "ul", "ol", "li", "h1", "h2", "h3",
        "blockquote", "span", "div", "table", "thead", "tbody", "tr", "td", "th", "img",
    ]
    .into_iter()
    .collect();
    builder.tags(tags);
    builder.link_rel(Some("noopener noreferrer"));
    builder
});

/// 净化 HTML 片段，返回可安全存储与展示的内容
pub fn sanitize_html(input: &str) -> String {
    SANITIZER.clean(input).to_string()
}
