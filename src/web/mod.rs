use derive_more::{Display, Error, From};

pub mod server;

#[derive(Debug, Display, From, Error)]
pub enum WebError {
    Io(std::io::Error),
    Update(crate::dns::update::UpdateError),
}

pub type Result<T> = std::result::Result<T, WebError>;
