use rhodium_stomp::{ConnectOptions, Connection, SubscribeOptions};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // This demo expects a STOMP broker on localhost:61613 (e.g. RabbitMQ
    // with the stomp plugin enabled).
    let conn = Connection::connect(
        ConnectOptions::new("127.0.0.1").credentials("guest", "guest"),
    )
    .await?;

    // Subscribe with client ack mode, so every message must be acked.
    let id = conn
        .subscribe(
            "/queue/example",
            vec![("ack".to_string(), "client".to_string())],
            SubscribeOptions::default(),
        )
        .await?;
    println!("subscribed id={}", id);

    // Receive in send-to-caller mode: every frame arrives on the owner
    // channel instead of being dispatched to callbacks.
    conn.set_send_to_caller(true).await?;

    while let Some(message) = conn.next_message().await {
        println!("received from {}:\n{}", message.destination, message.frame);
        conn.ack(&message.frame).await?;
    }

    conn.disconnect().await?;
    Ok(())
}
