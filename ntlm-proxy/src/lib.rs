#![deny(clippy::print_stdout, clippy::print_stderr)]

mod certs;
mod config;
mod config_api;
mod context;
mod credentials;
mod error;
mod http_proxy;
mod manager;
mod mitm;
mod noproxy;
mod ntlm;
mod pattern;
mod ports;
mod proxy;
mod responses;
mod state;
mod target;
mod tls;
mod upstream;

pub use config::Settings;
pub use credentials::Credential;
pub use credentials::ExplicitCredentials;
pub use credentials::NtlmVersion;
pub use error::UpstreamFailure;
pub use noproxy::NoProxyRules;
pub use ntlm::AuthScheme;
pub use ntlm::HandshakePhase;
pub use ntlm::HandshakeRequest;
pub use ntlm::NtlmEngine;
pub use pattern::HostPattern;
pub use pattern::best_match;
pub use ports::PORTS_FILE_NAME;
pub use ports::PortsFile;
pub use ports::delete_ports_file;
pub use ports::ports_file_path;
pub use ports::read_ports_file;
pub use ports::user_data_dir;
pub use ports::write_ports_file;
pub use proxy::NtlmProxy;
pub use proxy::NtlmProxyBuilder;
pub use proxy::NtlmProxyHandle;
pub use target::CompleteUrl;
pub use target::Scheme;
