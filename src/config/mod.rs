mod settings;

pub use settings::{
    DatabaseConfig, NotificationConfig, OtelConfig, Settings, SiteConfig, StoreConfig,
};
