use actix_web::{get, post, web, Responder, Scope};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    message::{Message, NewMessage},
    service::Service,
};

#[derive(Debug, Default, Deserialize)]
pub struct PublishQuery {
    max_retries: Option<u32>,
    /// Idempotency key. Re-publishing with the same key is a no-op.
    key: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PublishResponse {
    pub id: Uuid,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListTopicsResponse {
    pub topics: Vec<String>,
}

#[get("")]
async fn list_topics(service: web::Data<Service>) -> actix_web::Result<impl Responder> {
    let topics = service.topics().await?;

    Ok(web::Json(ListTopicsResponse { topics }))
}

#[post("/{topic}")]
async fn publish(
    service: web::Data<Service>,
    path: web::Path<String>,
    query: web::Query<PublishQuery>,
    payload: web::Json<serde_json::Value>,
) -> actix_web::Result<impl Responder> {
    let topic = path.into_inner();
    let PublishQuery { max_retries, key } = query.into_inner();

    let id = key.map(|key| Message::deterministic_id(&topic, &key));

    let id = service
        .publish_message(
            NewMessage::builder()
                .topic(topic)
                .payload(payload.into_inner())
                .maybe_id(id)
                .maybe_max_retries(max_retries)
                .build(),
        )
        .await?;

    Ok(web::Json(PublishResponse { id }))
}

#[get("/{topic}/stats")]
async fn stats(
    service: web::Data<Service>,
    path: web::Path<String>,
) -> actix_web::Result<impl Responder> {
    Ok(web::Json(service.stats(&path).await?))
}

#[post("/{topic}/reconcile")]
async fn reconcile(
    service: web::Data<Service>,
    path: web::Path<String>,
) -> actix_web::Result<impl Responder> {
    Ok(web::Json(service.reconcile(&path).await?))
}

pub fn service() -> Scope {
    web::scope("/queue")
        .service(list_topics)
        .service(publish)
        .service(stats)
        .service(reconcile)
}
