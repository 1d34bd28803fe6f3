use crate::config::{ConfigField, DeviceConfig};

pub const SAVED_BANNER: &str =
    "Configuration saved. The device will reconnect automatically.";

const PAGE_HEAD: &str = r#"<!doctype html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <meta name="viewport" content="width=device-width, initial-scale=1">
  <title>IoT Node Setup</title>
  <style>
    body{font-family:Arial,sans-serif;margin:0;padding:20px;background:#f2f2f2;color:#111}
    h1{margin-top:0}
    form{background:#fff;padding:20px;border-radius:8px;box-shadow:0 2px 6px rgba(0,0,0,.1)}
    label{display:block;margin-top:10px;font-weight:bold}
    input{width:100%;padding:8px;margin-top:4px;border:1px solid #ccc;border-radius:4px;box-sizing:border-box}
    button{margin-top:20px;padding:10px 16px;border:none;background:#0078d4;color:#fff;border-radius:4px;cursor:pointer}
    button:hover{background:#005a9e}
    p.status{padding:10px;background:#e6f4ff;border:1px solid #90c9ff;border-radius:4px}
  </style>
</head>
<body>
  <h1>Device configuration</h1>
"#;

const PAGE_TAIL: &str = "  <button type='submit'>Save</button></form>\n</body>\n</html>\n";

/// The configuration form pre-filled from `config`, with an optional status
/// banner above it.
pub fn render_config_page(config: &DeviceConfig, status: Option<&str>) -> String {
    let mut page = String::with_capacity(PAGE_HEAD.len() + 1536);
    page.push_str(PAGE_HEAD);

    if let Some(status) = status.filter(|status| !status.is_empty()) {
        page.push_str("  <p class='status'>");
        push_escaped(&mut page, status);
        page.push_str("</p>\n");
    }

    page.push_str("  <form method='POST' action='/save'>\n");
    for field in ConfigField::ALL {
        page.push_str("  <label>");
        page.push_str(field.label());
        page.push_str("</label><input name='");
        page.push_str(field.form_name());
        if field.is_secret() {
            page.push_str("' type='password");
        }
        page.push_str("' maxlength='");
        page.push_str(&(field.capacity() - 1).to_string());
        page.push_str("' value='");
        push_escaped(&mut page, config.get(field));
        page.push_str("' />\n");
    }
    page.push_str(PAGE_TAIL);

    page
}

fn push_escaped(out: &mut String, value: &str) {
    for ch in value.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\'' => out.push_str("&#39;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(ch),
        }
    }
}
