use actix_web::{web, HttpResponse, Responder};

use crate::state::{lock_tracker, SharedTracker};

/// Current live roots and history as JSON.
pub async fn get_tree(data: web::Data<SharedTracker>) -> impl Responder {
    let snapshot = lock_tracker(&data).snapshot();
    HttpResponse::Ok().json(snapshot)
}

/// Live subtree rooted at one pid.
pub async fn get_subtree(data: web::Data<SharedTracker>, pid: web::Path<u32>) -> impl Responder {
    let pid = pid.into_inner();
    let subtree = lock_tracker(&data).subtree(pid);
    match subtree {
        Some(node) => HttpResponse::Ok().json(node),
        None => HttpResponse::NotFound().json(serde_json::json!({
            "error": format!("pid {} is not in a live tree", pid)
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProcessEvent;
    use crate::state::new_state;
    use crate::services::tracker::{ProcessTreeTracker, TrackerConfig};
    use actix_web::{test, App};

    #[actix_web::test]
    async fn returns_live_roots_and_history() {
        let state = new_state(ProcessTreeTracker::new(TrackerConfig::default()));
        {
            let mut tracker = lock_tracker(&state);
            tracker
                .apply(ProcessEvent::Fork {
                    ts: 1,
                    ppid: 1,
                    pid: 100,
                    parent_comm: "systemd".to_string(),
                    comm: "sshd".to_string(),
                })
                .unwrap();
            tracker
                .apply(ProcessEvent::Exec {
                    pid: 300,
                    comm: "job".to_string(),
                    filename: "/bin/job".to_string(),
                })
                .unwrap();
            tracker
                .apply(ProcessEvent::Exit {
                    ts: 2,
                    pid: 300,
                    comm: "job".to_string(),
                })
                .unwrap();
        }

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/api/tree", web::get().to(get_tree)),
        )
        .await;
        let req = test::TestRequest::get().uri("/api/tree").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(body["live_count"], 2);
        assert_eq!(body["roots"][0]["pid"], 1);
        assert_eq!(body["roots"][0]["children"][0]["comm"], "sshd");
        assert_eq!(body["history"][0]["pid"], 300);
        assert_eq!(body["history"][0]["is_active"], false);
    }

    #[actix_web::test]
    async fn subtree_lookup_by_pid() {
        let state = new_state(ProcessTreeTracker::new(TrackerConfig::default()));
        lock_tracker(&state)
            .apply(ProcessEvent::Fork {
                ts: 1,
                ppid: 1,
                pid: 100,
                parent_comm: "systemd".to_string(),
                comm: "sshd".to_string(),
            })
            .unwrap();

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/api/tree/{pid}", web::get().to(get_subtree)),
        )
        .await;

        let req = test::TestRequest::get().uri("/api/tree/100").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["comm"], "sshd");
        assert_eq!(body["ppid"], 1);

        let req = test::TestRequest::get().uri("/api/tree/999").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), actix_web::http::StatusCode::NOT_FOUND);
        assert!(state.try_lock().is_ok(), "lock released after lookup");
    }

    #[actix_web::test]
    async fn health_reports_ok() {
        let app = test::init_service(App::new().route("/health", web::get().to(crate::api::health))).await;
        let req = test::TestRequest::get().uri("/health").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["status"], "healthy");
    }
}
