//! Encoding and decoding errors for the wire codecs.

/// Error produced when encoding or decoding PDUs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// The destination buffer cannot hold the encoded value.
    InsufficientSpace,
    /// The source buffer does not contain a valid encoding.
    Malformed,
}
