use actix_web::{delete, get, post, web, Responder, Scope};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::service::Service;

const MAX_PAGE: usize = 1000;

#[derive(Debug, Deserialize)]
pub struct Page {
    #[serde(default)]
    offset: usize,
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    50
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PurgeResponse {
    pub purged: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NackRequest {
    pub error: String,
}

#[get("/dead-letters/{topic}")]
async fn list_dead_letters(
    service: web::Data<Service>,
    path: web::Path<String>,
    page: web::Query<Page>,
) -> actix_web::Result<impl Responder> {
    let messages = service
        .list_dead_letters(&path, page.offset, page.limit.min(MAX_PAGE))
        .await?;

    Ok(web::Json(messages))
}

#[delete("/dead-letters/{topic}")]
async fn purge_dead_letters(
    service: web::Data<Service>,
    path: web::Path<String>,
) -> actix_web::Result<impl Responder> {
    let purged = service.purge_dead_letters(&path).await?;

    Ok(web::Json(PurgeResponse { purged }))
}

#[post("/dead-letters/replay/{id}")]
async fn replay_dead_letter(
    service: web::Data<Service>,
    path: web::Path<Uuid>,
) -> actix_web::Result<impl Responder> {
    Ok(web::Json(service.replay_dead_letter(*path).await?))
}

#[get("/messages/{id}")]
async fn get_message(
    service: web::Data<Service>,
    path: web::Path<Uuid>,
) -> actix_web::Result<impl Responder> {
    Ok(web::Json(service.get_message(*path).await?))
}

#[post("/messages/{id}/retry")]
async fn retry_message(
    service: web::Data<Service>,
    path: web::Path<Uuid>,
) -> actix_web::Result<impl Responder> {
    Ok(web::Json(service.retry_message(*path).await?))
}

#[post("/messages/{id}/ack")]
async fn ack_message(
    service: web::Data<Service>,
    path: web::Path<Uuid>,
) -> actix_web::Result<impl Responder> {
    Ok(web::Json(service.ack_message(*path).await?))
}

#[post("/messages/{id}/nack")]
async fn nack_message(
    service: web::Data<Service>,
    path: web::Path<Uuid>,
    body: web::Json<NackRequest>,
) -> actix_web::Result<impl Responder> {
    let NackRequest { error } = body.into_inner();

    Ok(web::Json(service.nack_message(*path, error).await?))
}

pub fn service() -> Scope {
    web::scope("/admin")
        .service(list_dead_letters)
        .service(purge_dead_letters)
        .service(replay_dead_letter)
        .service(get_message)
        .service(retry_message)
        .service(ack_message)
        .service(nack_message)
}
