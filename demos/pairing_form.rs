use env_logger;

use viera_client::pairing_server::{serve, DEFAULT_PAIRING_PORT};
use viera_client::VieraError;

// Serves the pairing form until interrupted; open http://localhost:8973/ in a browser
#[tokio::main]
async fn main() -> Result<(), VieraError> {
    env_logger::Builder::new()
        .filter(None, log::LevelFilter::Info)
        .init();

    serve(DEFAULT_PAIRING_PORT).await
}
