pub mod mqtt;
pub mod replay_file;

pub use mqtt::MqttSource;
pub use replay_file::ReplayFileSource;
