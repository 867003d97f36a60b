mod discovery;
mod health_probe;
mod token_supplier;
mod transport;

pub use discovery::{DiscoverySource, StaticDiscovery};
pub use health_probe::HealthProbe;
pub use token_supplier::TokenSupplier;
pub use transport::{ResponseStream, Transport};
