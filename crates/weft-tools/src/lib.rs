pub mod http;
pub mod sandbox;

pub use http::ReqwestTransport;
pub use sandbox::ProcessSandbox;
