/// Credentials handed to a session on initialization.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    /// Public license key, forwarded to the Billing Service on connect.
    pub license_key: Option<String>,
    /// When set, purchases whose order id carries a different merchant
    /// prefix are rejected.
    pub merchant_id: Option<String>,
}

impl Credentials {
    pub fn new(license_key: Option<String>, merchant_id: Option<String>) -> Self {
        Self {
            license_key,
            merchant_id,
        }
    }
}
