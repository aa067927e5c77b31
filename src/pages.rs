//! Inline HTML documents served by the hub.
//!
//! Landing, login, session management, fallback and error pages. Pages never
//! reveal container names; sessions are addressed by their public url path.

use axum::http::StatusCode;

use crate::db::Session;

/// Landing listing. Shared sessions only, or every session for admin callers.
pub fn landing_page(sessions: &[Session], admin: bool) -> String {
    let mut rows = String::new();
    for session in sessions {
        if !admin && !session.shared() {
            continue;
        }
        rows.push_str(&format!(
            "      <tr><td><a href=\"{path}\">{user}</a></td>\
             <td>{cpu:.1}%</td><td>{last}</td></tr>\n",
            path = session.url_path,
            user = session.username,
            cpu = session.cpu_pct(),
            last = session.last_activity.format("%Y-%m-%d %H:%M:%S UTC"),
        ));
    }

    if rows.is_empty() {
        rows.push_str("      <tr><td colspan=\"3\">No shared sessions</td></tr>\n");
    }

    format!(
        "<!DOCTYPE html>\n\
         <html>\n\
         <head><title>3DSlicer Hub</title></head>\n\
         <body>\n\
         <h1>3DSlicer Hub</h1>\n\
         <p><a href=\"/login\">Open your own session</a></p>\n\
         <table border=\"1\">\n\
         <tr><th>User</th><th>CPU</th><th>Last activity</th></tr>\n\
         {rows}\
         </table>\n\
         </body>\n\
         </html>\n"
    )
}

pub fn login_page() -> String {
    "<!DOCTYPE html>\n\
     <html>\n\
     <head><title>3DSlicer Hub - Login</title></head>\n\
     <body>\n\
     <h1>3DSlicer Hub</h1>\n\
     <form method=\"post\" action=\"/login\">\n\
     <label>Username <input type=\"text\" name=\"username\"></label><br>\n\
     <label>Password <input type=\"password\" name=\"password\"></label><br>\n\
     <button type=\"submit\">Start session</button>\n\
     </form>\n\
     </body>\n\
     </html>\n"
        .to_string()
}

/// Management page for one session: the link into the container plus the
/// share and close controls. `base_url` is the externally visible origin.
pub fn management_page(session: &Session, base_url: &str) -> String {
    let share_state = if session.shared() {
        "shared on the landing page"
    } else {
        "private"
    };
    let share_control = if session.shared() {
        format!(
            "<form method=\"post\" action=\"/sessions/{id}/unshare\">\
             <button type=\"submit\">Unshare</button></form>",
            id = session.id
        )
    } else {
        format!(
            "<form method=\"post\" action=\"/sessions/{id}/share?interactive=1\">\
             <button type=\"submit\">Share</button></form>",
            id = session.id
        )
    };

    format!(
        "<!DOCTYPE html>\n\
         <html>\n\
         <head><title>3DSlicer Hub - Session</title></head>\n\
         <body>\n\
         <h1>Session for {user}</h1>\n\
         <p><a href=\"{base}{path}\">Open 3DSlicer</a></p>\n\
         <p>This session is {share_state}.</p>\n\
         {share_control}\n\
         <form method=\"post\" action=\"/sessions/{id}/close\">\
         <button type=\"submit\">Close session</button></form>\n\
         </body>\n\
         </html>\n",
        user = session.username,
        base = base_url,
        path = session.url_path,
        id = session.id,
    )
}

pub fn fallback_page() -> String {
    "<!DOCTYPE html>\n\
     <html>\n\
     <head><title>3DSlicer Hub</title></head>\n\
     <body>\n\
     <h1>3DSlicer Hub</h1>\n\
     <p>Nothing here. The hub lives at <a href=\"/index.html\">/index.html</a>.</p>\n\
     </body>\n\
     </html>\n"
        .to_string()
}

pub fn error_page(status: StatusCode, message: &str) -> String {
    format!(
        "<!DOCTYPE html>\n\
         <html>\n\
         <head><title>3DSlicer Hub - {code}</title></head>\n\
         <body>\n\
         <h1>{code} {reason}</h1>\n\
         <p>{message}</p>\n\
         <p><a href=\"/login\">Back to login</a></p>\n\
         </body>\n\
         </html>\n",
        code = status.as_u16(),
        reason = status.canonical_reason().unwrap_or(""),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn session(shared: bool) -> Session {
        let id = Uuid::new_v4();
        Session {
            id,
            username: "free_user".to_string(),
            created_at: Utc::now(),
            last_activity: Utc::now(),
            url_path: format!("/{}/", id),
            service_address: Some("10.0.0.2:6901".to_string()),
            container_name: "tds-free_user".to_string(),
            restart: false,
            gpu: false,
            info: serde_json::json!({"shared": shared, "CPU_pct": 12.0}),
        }
    }

    #[test]
    fn test_landing_lists_shared_sessions() {
        let shared = session(true);
        let private = session(false);
        let body = landing_page(&[shared.clone(), private.clone()], false);

        assert!(body.contains(&shared.url_path));
        assert!(!body.contains(&private.url_path));
    }

    #[test]
    fn test_landing_admin_sees_everything() {
        let private = session(false);
        let body = landing_page(&[private.clone()], true);
        assert!(body.contains(&private.url_path));
    }

    #[test]
    fn test_pages_do_not_reveal_container_names() {
        let s = session(true);
        for body in [
            landing_page(&[s.clone()], true),
            management_page(&s, "http://localhost"),
        ] {
            assert!(!body.contains(&s.container_name));
        }
    }

    #[test]
    fn test_management_page_share_toggle() {
        let s = session(false);
        let body = management_page(&s, "http://localhost");
        assert!(body.contains(&format!("/sessions/{}/share", s.id)));
        assert!(body.contains(&format!("/sessions/{}/close", s.id)));
    }
}
