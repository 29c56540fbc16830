//! Self-contained page served when a navigation fails with nothing cached.

use crate::http::Response;

pub fn render(path: &str) -> Response {
  let path = escape_html(path);
  let html = format!(
    r#"<!DOCTYPE html>
<html lang="es">
<head>
  <meta charset="utf-8">
  <meta name="viewport" content="width=device-width, initial-scale=1">
  <title>Sin conexión</title>
  <style>
    body {{ font-family: system-ui, sans-serif; display: flex; min-height: 100vh;
           align-items: center; justify-content: center; margin: 0; background: #f4f1ea; }}
    main {{ max-width: 28rem; padding: 2rem; text-align: center; }}
    code {{ background: #e6e0d4; padding: 0.1rem 0.3rem; border-radius: 3px; }}
    a {{ display: inline-block; margin-top: 1rem; padding: 0.5rem 1rem;
        background: #2f6b3a; color: #fff; text-decoration: none; border-radius: 4px; }}
  </style>
</head>
<body>
  <main>
    <h1>Sin conexión</h1>
    <p>No se pudo cargar <code>{path}</code> y no hay una copia guardada.</p>
    <p>Los cambios que hagas se sincronizarán al recuperar la conexión.</p>
    <a href="{path}">Reintentar</a>
  </main>
</body>
</html>
"#,
    path = path
  );

  Response::synthetic(503, "text/html; charset=utf-8", html)
}

fn escape_html(input: &str) -> String {
  let mut out = String::with_capacity(input.len());
  for c in input.chars() {
    match c {
      '&' => out.push_str("&amp;"),
      '<' => out.push_str("&lt;"),
      '>' => out.push_str("&gt;"),
      '"' => out.push_str("&quot;"),
      '\'' => out.push_str("&#39;"),
      _ => out.push(c),
    }
  }
  out
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::http::ResponseSource;

  #[test]
  fn test_page_embeds_requested_path_with_retry_link() {
    let response = render("/ganado/12");
    assert_eq!(response.source, ResponseSource::Synthetic);
    assert_eq!(response.status, 503);
    let html = response.text();
    assert!(html.contains("<code>/ganado/12</code>"));
    assert!(html.contains(r#"href="/ganado/12""#));
  }

  #[test]
  fn test_path_is_escaped() {
    let html = render("/x\"><script>alert(1)</script>").text();
    assert!(!html.contains("<script>alert"));
    assert!(html.contains("&lt;script&gt;"));
  }
}
