pub mod schema;

pub use schema::{Config, GatewayConfig, SyncConfig};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reexported_config_default_is_constructible() {
        let config = Config::default();
        assert_eq!(config.gateway.host, "127.0.0.1");
        assert_eq!(config.sync.ring_buffer_size, 100);
    }
}
