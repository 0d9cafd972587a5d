pub mod acme;
pub mod aliyun;
pub mod api;
pub mod cdn;
pub mod config;
pub mod error;
pub mod observability;
pub mod tls;
