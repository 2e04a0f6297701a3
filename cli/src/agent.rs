// Device-side delegate: prints what the cloud sends, answers configuration
// and ping requests, and collects responses to requests we sent.

use cloudlink_core::{
    Command, ConfigService, Delivery, DeliveryStatus, Direction, SessionError, SmDelegate,
    SmError, TransportKind,
};
use colored::*;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::OnceLock;
use tracing::{error, info, warn};

/// Response the poll loop still has to send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub request_id: u16,
    pub payload: Vec<u8>,
}

/// How a request we sent ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Response(Vec<u8>),
    Failed(SessionError),
}

#[derive(Default)]
pub struct DeviceAgent {
    config_service: OnceLock<ConfigService>,
    /// Cloud requests still being delivered in chunks
    partial: Mutex<HashMap<(u16, Direction), Vec<u8>>>,
    replies: Mutex<Vec<Reply>>,
    outcomes: Mutex<HashMap<u16, Outcome>>,
    /// Set when answering left the device unable to continue
    fatal: Mutex<Option<SmError>>,
    quiet: bool,
}

impl DeviceAgent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Suppress console output (logging still applies).
    #[cfg(test)]
    pub fn quiet() -> Self {
        Self {
            quiet: true,
            ..Self::default()
        }
    }

    /// The service is built from the connector, which needs the agent first.
    pub fn attach(&self, service: ConfigService) {
        if self.config_service.set(service).is_err() {
            warn!("configuration service already attached");
        }
    }

    pub fn take_replies(&self) -> Vec<Reply> {
        std::mem::take(&mut *self.replies.lock())
    }

    pub fn take_outcome(&self, request_id: u16) -> Option<Outcome> {
        self.outcomes.lock().remove(&request_id)
    }

    pub fn take_fatal(&self) -> Option<SmError> {
        self.fatal.lock().take()
    }

    fn answer(&self, command: Command, request: &[u8]) -> Result<Vec<u8>, SmError> {
        match (command, self.config_service.get()) {
            (Command::Config, Some(service)) => service.handle(request),
            _ => Ok(Vec::new()),
        }
    }

    fn print(&self, delivery: &Delivery<'_>, body: &[u8]) {
        if self.quiet {
            return;
        }
        let arrow = match delivery.direction {
            Direction::CloudOriginated => "←".bright_blue(),
            Direction::ClientOriginated => "↩".bright_green(),
        };
        let label = format!("{:?} #{}", delivery.command, delivery.request_id);
        println!("{} {} [{}]", arrow, label.bright_cyan(), delivery.transport);
        if let Some(code) = delivery.error {
            println!("   {} {:?}", "error:".red(), code);
        }
        match std::str::from_utf8(body) {
            Ok(text) if !text.is_empty() => println!("   {}", text),
            Ok(_) => println!("   {}", "(empty)".dimmed()),
            Err(_) => println!("   {}", hex::encode(body).dimmed()),
        }
    }
}

impl SmDelegate for DeviceAgent {
    fn deliver(&self, delivery: &Delivery<'_>) -> DeliveryStatus {
        let key = (delivery.request_id, delivery.direction);
        let body = {
            let mut partial = self.partial.lock();
            let buffer = partial.entry(key).or_default();
            buffer.extend_from_slice(delivery.data);
            if !delivery.last {
                return DeliveryStatus::Working;
            }
            partial.remove(&key).unwrap_or_default()
        };

        info!(
            transport = %delivery.transport,
            request_id = delivery.request_id,
            command = ?delivery.command,
            len = body.len(),
            "message delivered"
        );
        self.print(delivery, &body);

        match delivery.direction {
            Direction::CloudOriginated => {
                if delivery.response_needed {
                    match self.answer(delivery.command, &body) {
                        Ok(payload) => self.replies.lock().push(Reply {
                            request_id: delivery.request_id,
                            payload,
                        }),
                        Err(e) => {
                            error!(request_id = delivery.request_id, error = %e, "unable to answer request");
                            *self.fatal.lock() = Some(e);
                            return DeliveryStatus::Abort;
                        }
                    }
                }
            }
            Direction::ClientOriginated => {
                self.outcomes
                    .lock()
                    .insert(delivery.request_id, Outcome::Response(body));
            }
        }
        DeliveryStatus::Working
    }

    fn more_data(&self, transport: TransportKind) {
        info!(transport = %transport, "cloud has more data queued");
    }

    fn reboot(&self) -> DeliveryStatus {
        // Rebooting the host is out of reach for the CLI
        warn!("reboot requested by the cloud; ignoring");
        DeliveryStatus::Working
    }

    fn session_failed(&self, transport: TransportKind, request_id: u16, error: SessionError) {
        warn!(transport = %transport, request_id, error = %error, "request failed");
        self.partial
            .lock()
            .remove(&(request_id, Direction::ClientOriginated));
        self.outcomes.lock().insert(request_id, Outcome::Failed(error));
    }
}
