//! Per-lead template rendering. Placeholders are `{name}` tokens;
//! rendering never fails, unknown tokens pass through untouched.

use dripflow_core::Lead;

/// Substitute lead fields into a message template.
///
/// Built-in tokens: `{first_name}`, `{last_name}`, `{username}`,
/// `{chat_id}`. Any other token is looked up in the lead's custom
/// fields and left as-is when absent.
pub fn render(template: &str, lead: &Lead) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let tail = &rest[start..];
        match tail[1..].find('}') {
            Some(rel_end) => {
                let token = &tail[1..1 + rel_end];
                match lookup(token, lead) {
                    Some(value) => out.push_str(&value),
                    None => out.push_str(&tail[..rel_end + 2]),
                }
                rest = &tail[rel_end + 2..];
            }
            None => {
                // Unclosed brace, keep literally.
                out.push_str(tail);
                return out;
            }
        }
    }
    out.push_str(rest);
    out
}

fn lookup(token: &str, lead: &Lead) -> Option<String> {
    match token {
        "first_name" => Some(lead.first_name.clone()),
        "last_name" => Some(lead.last_name.clone()),
        "username" => Some(lead.username.clone()),
        "chat_id" => Some(lead.chat_id.clone()),
        other => lead.custom_fields.get(other).cloned(),
    }
}
