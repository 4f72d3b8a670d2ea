//! Consumer connection seam
//!
//! The message writer fans deliveries across a changing set of consumer
//! connections. The transport itself lives outside this crate; writers see
//! it through this trait.

/// One downstream consumer connection
pub trait ConsumerWriter: Send + Sync {
    /// Write one message payload to the consumer
    ///
    /// A returned error marks this consumer as failed for the attempt; the
    /// message writer moves on to the next consumer and retries later.
    fn write(&self, payload: &[u8]) -> std::io::Result<()>;

    /// Address of the consumer connection, used to remove it from the set
    fn address(&self) -> &str;
}
