#[actix_web::main]
async fn main() -> eyre::Result<()> {
    tempoq::run().start().await
}
