//! HTTP implementations of the backend seams.

mod http_llm;
mod http_speech;

pub use http_llm::HttpLlmBackend;
pub use http_speech::HttpSpeechBackend;
