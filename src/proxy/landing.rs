//! Landing page served for hostnames with no configured origin

pub const LANDING_PAGE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <meta name="viewport" content="width=device-width, initial-scale=1">
  <title>Pravah CDN</title>
  <style>
    body { font-family: system-ui, sans-serif; margin: 0; min-height: 100vh;
           display: flex; align-items: center; justify-content: center;
           background: #0f172a; color: #e2e8f0; }
    main { max-width: 32rem; padding: 2rem; text-align: center; }
    h1 { font-size: 1.75rem; margin-bottom: 0.5rem; }
    p { color: #94a3b8; line-height: 1.5; }
  </style>
</head>
<body>
  <main>
    <h1>Pravah CDN</h1>
    <p>This domain is not configured on this edge node yet.</p>
    <p>If you own this domain, add it to your Pravah account and point it at your origin.</p>
  </main>
</body>
</html>
"#;
