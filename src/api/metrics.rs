use actix_web::{web, HttpResponse, Responder};

use crate::metrics::METRICS;
use crate::state::{lock_tracker, SharedTracker};

pub async fn get_metrics(data: web::Data<SharedTracker>) -> impl Responder {
    // 只在锁内取快照
    let snapshot = lock_tracker(&data).snapshot();
    METRICS.observe_snapshot(&snapshot);

    match METRICS.render() {
        Ok(metrics_text) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(metrics_text),
        Err(e) => {
            log::error!("Failed to render metrics: {}", e);
            HttpResponse::InternalServerError().body("Failed to render metrics")
        }
    }
}
