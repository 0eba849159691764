mod daemon;
mod endpoint;
mod postgres;

pub use daemon::DaemonService;
pub use endpoint::EndpointService;
pub use postgres::PostgresService;
