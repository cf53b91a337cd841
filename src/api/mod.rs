pub mod metrics;
pub mod tree;

pub use metrics::get_metrics;
pub use tree::{get_subtree, get_tree};

use actix_web::{HttpResponse, Responder};

pub async fn health() -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy"
    }))
}
