pub mod control;
pub mod envelope;
pub mod header;
pub mod registry;

/// A random 128 bit nonce, hex encoded. Broadcasts carry one so that receivers can drop
///  duplicates.
pub fn create_nonce() -> String {
    format!("{:032x}", rand::random::<u128>())
}
