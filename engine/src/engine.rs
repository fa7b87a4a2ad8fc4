use tokio::sync::mpsc::{Receiver, Sender};
use tracing::{error, info, warn};

use crate::{
    Hal,
    error::HalError,
    message::{Action, Message},
};

/// Serializes control requests onto the HAL context.
pub struct Engine {
    rx: Receiver<Message>,
    clients: Vec<Sender<Message>>,
    hal: Hal,
}

impl Engine {
    pub fn new(rx: Receiver<Message>, hal: Hal) -> Self {
        Self {
            rx,
            clients: vec![],
            hal,
        }
    }

    pub async fn init(&mut self) {
        info!(
            "Control engine up, {} capture devices known",
            self.hal.input.devices().len()
        );
    }

    async fn notify_clients(&mut self, action: Result<Action, String>) {
        let mut alive = Vec::with_capacity(self.clients.len());
        for client in self.clients.drain(..) {
            match client.send(Message::Response(action.clone())).await {
                Ok(()) => alive.push(client),
                Err(e) => warn!("Dropping client: {e}"),
            }
        }
        self.clients = alive;
    }

    fn handle_request(&self, a: Action) -> Result<Action, HalError> {
        let output = &self.hal.output;
        let input = &self.hal.input;
        match a {
            Action::SetParameters(ref kv) => output.set_parameters(kv).map(|()| a),
            Action::SetInputParameters(ref kv) => input.set_parameters(kv).map(|()| a),
            Action::SetDeviceConnectionState { class, connected } => {
                output.set_device_connection_state(class, connected);
                Ok(a)
            }
            Action::SetMasterVolume(volume) => output.set_master_volume(volume).map(|()| a),
            Action::SetMasterMute(mute) => {
                output.set_master_mute(mute);
                Ok(a)
            }
            Action::SetMicMute(mute) => {
                input.set_mic_mute(mute);
                Ok(a)
            }
            Action::GetParameters(keys) => Ok(Action::Parameters(output.get_parameters(&keys))),
            Action::GetStatus => Ok(Action::Status(Box::new(self.hal.snapshot()))),
            Action::Quit => Ok(a),
            Action::Parameters(_) | Action::Status(_) => Err(HalError::InvalidOperation),
        }
    }

    pub async fn work(&mut self) {
        while let Some(message) = self.rx.recv().await {
            match message {
                Message::Channel(s) => {
                    self.clients.push(s);
                }
                Message::Request(Action::Quit) => {
                    self.hal.shutdown();
                    self.notify_clients(Ok(Action::Quit)).await;
                    return;
                }
                Message::Request(a) => {
                    let result = self.handle_request(a.clone()).map_err(|e| {
                        error!("Request {a:?} failed: {e}");
                        e.to_string()
                    });
                    self.notify_clients(result).await;
                }
                Message::Response(_) => {}
            }
        }
        self.hal.shutdown();
    }
}
