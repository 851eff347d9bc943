use std::env;

use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use vend_eng::csv::{read_ops, write_products, write_users};
use vend_eng::{Dispatcher, Engine, EngineConfig};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("warn".parse().unwrap()))
        .with_writer(std::io::stderr)
        .init();

    let path = env::args().nth(1).expect("usage: vend-eng <ops.csv>");

    if !path.ends_with(".csv") {
        warn!(path, "input file seems to not be a csv file");
    }

    let (dispatcher, mut notices) = Dispatcher::channel();
    let engine = Engine::new(EngineConfig::default(), dispatcher);

    // stand-in delivery layer: log what would be sent
    tokio::spawn(async move {
        while let Some(notice) = notices.recv().await {
            info!(recipient = ?notice.recipient, event = ?notice.event, "notice");
        }
    });

    let (op_sender, op_receiver) = tokio::sync::mpsc::channel(16);

    tokio::spawn(async move {
        for result in read_ops(&path) {
            match result {
                Ok(op) => {
                    op_sender.send(op).await.unwrap();
                }
                Err(e) => {
                    warn!("{e}");
                }
            }
        }
    });

    engine.run(ReceiverStream::new(op_receiver)).await;

    write_users(engine.ledger().snapshot());
    println!();
    write_products(engine.inventory().snapshot());
}
