pub mod pickle;
pub mod value;

pub use pickle::PickleError;
pub use value::PyValue;

/// Decodes a serialized object graph. Pickle is the only format the
/// producing service writes.
pub fn parse(input: &[u8]) -> Result<PyValue, PickleError> {
    pickle::parse(input)
}
