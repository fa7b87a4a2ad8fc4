use crate::HalSnapshot;
use crate::format::DeviceClass;
use tokio::sync::mpsc::Sender;

#[derive(Clone, Debug)]
pub enum Action {
    Quit,
    SetParameters(String),
    SetInputParameters(String),
    SetDeviceConnectionState { class: DeviceClass, connected: bool },
    SetMasterVolume(f32),
    SetMasterMute(bool),
    SetMicMute(bool),
    GetParameters(String),
    Parameters(String),
    GetStatus,
    Status(Box<HalSnapshot>),
}

#[derive(Clone, Debug)]
pub enum Message {
    Channel(Sender<Self>),

    Request(Action),
    Response(Result<Action, String>),
}
