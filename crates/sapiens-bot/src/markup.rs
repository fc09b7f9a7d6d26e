// MarkdownV2 helpers.

/// Characters Telegram's MarkdownV2 treats as markup.
const SPECIAL: &[char] = &[
    '\\', '_', '*', '[', ']', '(', ')', '~', '`', '>', '#', '+', '-', '=', '|', '{', '}', '.', '!',
];

/// Escape free text for embedding in a MarkdownV2 message.
pub fn escape_markdown_v2(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + text.len() / 8);
    for c in text.chars() {
        if SPECIAL.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Bold span around already-escaped text.
pub fn bold(escaped: &str) -> String {
    format!("*{escaped}*")
}
