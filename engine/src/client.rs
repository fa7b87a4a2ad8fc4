use crate::format::DeviceClass;
use crate::message::{Action, Message};
use tokio::sync::mpsc::{Receiver, Sender, channel};
use tracing::error;

/// Sends requests to the control engine and receives its responses.
#[derive(Debug)]
pub struct Client {
    tx: Sender<Message>,
    rx: Receiver<Message>,
}

impl Client {
    pub async fn new(tx: Sender<Message>) -> Self {
        let (client_tx, rx) = channel::<Message>(32);
        if let Err(e) = tx.send(Message::Channel(client_tx)).await {
            error!("Error registering client: {e}");
        }
        Self { tx, rx }
    }

    pub async fn send(&self, action: Action) {
        if let Err(e) = self.tx.send(Message::Request(action)).await {
            error!("Error sending request to engine: {e}");
        }
    }

    /// Sends `action` and waits for the next response.
    pub async fn request(&mut self, action: Action) -> Result<Action, String> {
        self.send(action).await;
        loop {
            match self.rx.recv().await {
                Some(Message::Response(result)) => return result,
                Some(_) => continue,
                None => return Err("engine is gone".to_string()),
            }
        }
    }

    pub async fn set_parameters(&mut self, kv_pairs: &str) -> Result<Action, String> {
        self.request(Action::SetParameters(kv_pairs.to_string()))
            .await
    }

    pub async fn get_parameters(&mut self, keys: &str) -> Result<String, String> {
        match self.request(Action::GetParameters(keys.to_string())).await? {
            Action::Parameters(values) => Ok(values),
            other => Err(format!("unexpected response {other:?}")),
        }
    }

    pub async fn connect(&mut self, class: DeviceClass, connected: bool) -> Result<Action, String> {
        self.request(Action::SetDeviceConnectionState { class, connected })
            .await
    }

    pub async fn status(&mut self) -> Result<crate::HalSnapshot, String> {
        match self.request(Action::GetStatus).await? {
            Action::Status(snapshot) => Ok(*snapshot),
            other => Err(format!("unexpected response {other:?}")),
        }
    }

    pub async fn quit(mut self) {
        if let Err(e) = self.request(Action::Quit).await {
            error!("Quit request failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn requests_fail_once_the_engine_is_gone() {
        let (tx, rx) = channel::<Message>(8);
        drop(rx);
        let mut client = Client::new(tx).await;
        assert_eq!(
            client.get_parameters("hdmi-allowed").await,
            Err("engine is gone".to_string())
        );
        client.quit().await;
    }

    #[tokio::test]
    async fn rejected_quit_still_returns() {
        let (tx, mut rx) = channel::<Message>(8);
        let engine = tokio::spawn(async move {
            let mut reply = None;
            while let Some(msg) = rx.recv().await {
                match msg {
                    Message::Channel(client) => reply = Some(client),
                    Message::Request(Action::Quit) => {
                        if let Some(client) = reply.take() {
                            let _ = client.send(Message::Response(Err("busy".to_string()))).await;
                        }
                        return true;
                    }
                    _ => {}
                }
            }
            false
        });
        let client = Client::new(tx).await;
        client.quit().await;
        assert!(engine.await.expect("engine task"));
    }
}
