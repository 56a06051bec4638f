//! Channel plumbing between the consumer, the engine and the backends

use core::fmt;

use crate::config::ChannelConfig;
use crate::events::{AppEvent, BackendEvent, Command};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelError {
    ChannelFull,
    ChannelClosed,
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelError::ChannelFull => write!(f, "Channel buffer is full"),
            ChannelError::ChannelClosed => write!(f, "Channel is closed"),
        }
    }
}

impl std::error::Error for ChannelError {}

impl From<ChannelError> for crate::PeerlinkError {
    fn from(err: ChannelError) -> Self {
        crate::PeerlinkError::channel_error(err.to_string())
    }
}

pub type CommandSender = tokio::sync::mpsc::Sender<Command>;
pub type CommandReceiver = tokio::sync::mpsc::Receiver<Command>;
/// Backend events fan in from arbitrary native contexts, so the channel never blocks a sender
pub type BackendEventSender = tokio::sync::mpsc::UnboundedSender<BackendEvent>;
pub type BackendEventReceiver = tokio::sync::mpsc::UnboundedReceiver<BackendEvent>;
pub type AppEventSender = tokio::sync::mpsc::UnboundedSender<AppEvent>;
pub type AppEventReceiver = tokio::sync::mpsc::UnboundedReceiver<AppEvent>;

pub fn create_command_channel(config: &ChannelConfig) -> (CommandSender, CommandReceiver) {
    tokio::sync::mpsc::channel(config.command_buffer_size)
}

pub fn create_backend_event_channel() -> (BackendEventSender, BackendEventReceiver) {
    tokio::sync::mpsc::unbounded_channel()
}

pub fn create_app_event_channel() -> (AppEventSender, AppEventReceiver) {
    tokio::sync::mpsc::unbounded_channel()
}

/// Try to send without blocking, mapping tokio's error into [`ChannelError`]
pub trait NonBlockingSend<T> {
    fn try_send_now(&self, item: T) -> Result<(), ChannelError>;
}

impl<T> NonBlockingSend<T> for tokio::sync::mpsc::Sender<T> {
    fn try_send_now(&self, item: T) -> Result<(), ChannelError> {
        self.try_send(item).map_err(|err| match err {
            tokio::sync::mpsc::error::TrySendError::Full(_) => ChannelError::ChannelFull,
            tokio::sync::mpsc::error::TrySendError::Closed(_) => ChannelError::ChannelClosed,
        })
    }
}

impl<T> NonBlockingSend<T> for tokio::sync::mpsc::UnboundedSender<T> {
    fn try_send_now(&self, item: T) -> Result<(), ChannelError> {
        self.send(item).map_err(|_| ChannelError::ChannelClosed)
    }
}
