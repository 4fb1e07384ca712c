//! Dashboard page and the injected status bubble
//!
//! The dashboard is a single server-rendered page; guest pages get
//! `spaces.js`, a floating status bubble that follows the event stream and
//! soft-reloads the page when its app swaps to a new healthy port.

use crate::registry::{App, Status};

/// Render the dashboard index page.
pub fn render(status: &Status, apps: &[App]) -> String {
    let postgres_dot = if status.postgres_running { "on" } else { "off" };

    let body = if apps.is_empty() {
        "<div class=\"empty\">No apps registered. Run your app with the cheetah supervisor to register.</div>".to_string()
    } else {
        let mut rows = String::new();
        for app in apps {
            let watch: String = app
                .watch
                .match_patterns
                .iter()
                .map(|p| format!("<code>{p}</code> "))
                .collect();
            rows.push_str(&format!(
                "<tr>\
                 <td><strong>{space}</strong></td>\
                 <td><code>{dir}</code></td>\
                 <td>:{blue}</td>\
                 <td>:{green}</td>\
                 <td>:{active}</td>\
                 <td class=\"{health}\">{health}</td>\
                 <td>{watch}</td>\
                 <td>{logs}</td>\
                 </tr>\n",
                space = app.space,
                dir = app.dir,
                blue = app.ports.blue,
                green = app.ports.green,
                active = app.ports.active,
                health = app.health.status,
                watch = watch,
                logs = app.logs.len(),
            ));
        }
        format!(
            "<table>\n<thead>\n<tr>\
             <th>Space</th><th>Dir</th><th>Blue</th><th>Green</th><th>Active</th>\
             <th>Health</th><th>Watch</th><th>Logs</th>\
             </tr>\n</thead>\n<tbody>\n{rows}</tbody>\n</table>"
        )
    };

    format!(
        r#"<!DOCTYPE html>
<html>
<head>
<title>Cheetah</title>
<meta charset="utf-8">
<style>
  body {{ font-family: system-ui, sans-serif; margin: 2rem; background: #0a0a0a; color: #e0e0e0; }}
  h1 {{ color: #f0f0f0; }}
  .status {{ background: #1a1a2e; padding: 1rem; border-radius: 8px; margin-bottom: 2rem; }}
  .status span {{ margin-right: 2rem; }}
  .dot {{ display: inline-block; width: 10px; height: 10px; border-radius: 50%; margin-right: 4px; }}
  .dot.on {{ background: #4ade80; }}
  .dot.off {{ background: #ef4444; }}
  table {{ width: 100%; border-collapse: collapse; }}
  th, td {{ text-align: left; padding: 0.5rem 1rem; border-bottom: 1px solid #2a2a3e; }}
  th {{ color: #888; font-weight: 500; font-size: 0.85rem; text-transform: uppercase; }}
  tr:hover {{ background: #1a1a2e; }}
  .healthy {{ color: #4ade80; }}
  .unhealthy {{ color: #ef4444; }}
  .unknown {{ color: #888; }}
  .building {{ color: #facc15; }}
  code {{ background: #1a1a2e; padding: 2px 6px; border-radius: 4px; font-size: 0.85rem; }}
  .empty {{ text-align: center; padding: 3rem; color: #666; }}
</style>
</head>
<body>
<h1>Cheetah</h1>
<div class="status">
  <span><span class="dot {postgres_dot}"></span> Postgres :{postgres_port}</span>
  <span>Uptime: {uptime}</span>
  <span>Apps: {app_count}</span>
  <span>v{version}</span>
</div>
{body}
</body>
</html>"#,
        postgres_dot = postgres_dot,
        postgres_port = status.postgres_port,
        uptime = status.uptime,
        app_count = status.app_count,
        version = status.version,
        body = body,
    )
}

/// The status bubble injected into guest pages. Follows the SSE stream and
/// reloads the page once its app swaps to a new healthy port.
pub const SPACES_JS: &str = r#"(function() {
  const script = document.currentScript;
  const space = script?.getAttribute("data-space") || "";
  const initialPort = script?.getAttribute("data-port") || "";

  const el = document.createElement("div");
  el.id = "__cheetah";
  el.innerHTML = '<span class="__sc-dot"></span> <span class="__sc-label"></span>';
  document.body.appendChild(el);

  const menu = document.createElement("div");
  menu.id = "__cheetah-menu";
  document.body.appendChild(menu);

  const style = document.createElement("style");
  style.textContent = `
    #__cheetah {
      position: fixed; bottom: 12px; right: 12px; z-index: 2147483647;
      background: #1a1a2e; color: #e0e0e0; border: 1px solid #2a2a3e;
      border-radius: 20px; padding: 6px 14px; font: 12px/1 system-ui, sans-serif;
      cursor: pointer; display: flex; align-items: center; gap: 6px;
      box-shadow: 0 2px 8px rgba(0,0,0,0.4); transition: opacity 0.2s;
      opacity: 0.85; user-select: none;
    }
    #__cheetah:hover { opacity: 1; }
    .__sc-dot {
      width: 8px; height: 8px; border-radius: 50%;
      background: #888; display: inline-block;
    }
    .__sc-dot.healthy { background: #4ade80; }
    .__sc-dot.unhealthy { background: #ef4444; }
    .__sc-dot.unknown { background: #888; }
    .__sc-dot.building { background: #facc15; }
    #__cheetah-menu {
      position: fixed; bottom: 44px; right: 12px; z-index: 2147483647;
      background: #1a1a2e; color: #e0e0e0; border: 1px solid #2a2a3e;
      border-radius: 8px; padding: 4px 0; font: 12px/1 system-ui, sans-serif;
      box-shadow: 0 2px 12px rgba(0,0,0,0.5);
      display: none; min-width: 180px;
    }
    #__cheetah-menu.open { display: block; }
    .__sc-item {
      display: flex; align-items: center; gap: 8px;
      padding: 8px 14px; cursor: pointer; text-decoration: none; color: #e0e0e0;
    }
    .__sc-item:hover { background: #2a2a3e; }
    .__sc-item.active { background: #2a2a3e; font-weight: 600; }
    .__sc-item .info { color: #888; font-size: 11px; margin-left: auto; }
    .__sc-sep { border-top: 1px solid #2a2a3e; margin: 4px 0; }
  `;
  document.head.appendChild(style);

  const dot = el.querySelector(".__sc-dot");
  const label = el.querySelector(".__sc-label");
  label.textContent = space + " :" + initialPort;

  if (space === "cheetah") dot.className = "__sc-dot healthy";

  let allApps = {};
  let menuOpen = false;

  el.addEventListener("click", function(e) {
    e.stopPropagation();
    menuOpen = !menuOpen;
    renderMenu();
  });

  document.addEventListener("click", function() {
    if (menuOpen) { menuOpen = false; renderMenu(); }
  });

  menu.addEventListener("click", function(e) { e.stopPropagation(); });

  function renderMenu() {
    if (!menuOpen) { menu.className = ""; return; }
    menu.className = "open";
    const list = Object.values(allApps);
    let h = "";
    for (const a of list) {
      const p = a.ports.active;
      const active = a.space === space ? " active" : "";
      const href = location.protocol + "//" + a.space + ".localhost:" + location.port + "/";
      h += '<a class="__sc-item' + active + '" href="' + href + '">' +
        '<span class="__sc-dot ' + a.health.status + '"></span>' +
        a.space +
        '<span class="info">:' + p + '</span></a>';
    }
    if (list.length > 0) h += '<div class="__sc-sep"></div>';
    const scActive = space === "cheetah" ? " active" : "";
    h += '<a class="__sc-item' + scActive + '" href="//cheetah.localhost:' + location.port + '/">' +
      '<span class="__sc-dot healthy"></span>cheetah' +
      '<span class="info">:' + location.port + '</span></a>';
    menu.innerHTML = h;
  }

  let lastPort = initialPort;
  let reloading = false;

  function update(app) {
    if (!app) return;
    allApps[app.space] = app;
    if (menuOpen) renderMenu();

    if (app.space !== space) return;

    dot.className = "__sc-dot " + app.health.status;
    const p = app.ports.active;
    label.textContent = app.space + " :" + p;

    if (String(p) !== lastPort && app.health.status === "healthy" && !reloading) {
      reloading = true;
      label.textContent = "reloading...";
      setTimeout(() => location.reload(), 300);
    }
    lastPort = String(p);
  }

  const es = new EventSource("//cheetah.localhost:" + location.port + "/api/events");

  es.addEventListener("init", function(e) {
    const apps = JSON.parse(e.data);
    allApps = {};
    for (const a of apps) allApps[a.space] = a;
    const app = allApps[space];
    if (app) update(app);
  });

  es.addEventListener("app", function(e) {
    update(JSON.parse(e.data));
  });

  es.addEventListener("deregister", function(e) {
    const data = JSON.parse(e.data);
    delete allApps[data.space];
    if (menuOpen) renderMenu();
    if (data.space === space) {
      dot.className = "__sc-dot unhealthy";
      label.textContent = space + " disconnected";
    }
  });

  es.onerror = function() {
    dot.className = "__sc-dot unhealthy";
  };
})();
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{AppIn, Registry, RegistryConfig};

    #[test]
    fn test_render_empty_and_populated() {
        let reg = Registry::new(RegistryConfig {
            blue_port_start: 4000,
            dashboard_port: 50000,
            postgres_port: 54320,
        });
        reg.set_postgres(true, "postgres://localhost:54320/postgres");

        let page = render(&reg.status(), &reg.list());
        assert!(page.contains("No apps registered"));
        assert!(page.contains("dot on"));

        reg.register(AppIn {
            space: "buffalo".to_string(),
            dir: "/work/buffalo".to_string(),
            ..Default::default()
        });
        let page = render(&reg.status(), &reg.list());
        assert!(page.contains("<strong>buffalo</strong>"));
        assert!(page.contains(":4000"));
        assert!(page.contains("unknown"));
    }

    #[test]
    fn test_spaces_js_mentions_event_stream() {
        assert!(SPACES_JS.contains("/api/events"));
        assert!(SPACES_JS.contains("data-space"));
    }
}
