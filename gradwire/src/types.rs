use crate::reduce::Summable;

/// Rank of a worker in a communicator group (0-indexed).
pub type Rank = u32;

/// Element types that can be placed on the wire.
///
/// Gradients travel as `f32`; positions, counts and packed sign words use
/// the integer types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DataType {
    F32 = 0,
    F64 = 1,
    I32 = 2,
    I64 = 3,
    U32 = 4,
}

impl DataType {
    /// Size of one element in bytes.
    pub const fn size_in_bytes(self) -> usize {
        match self {
            DataType::F32 | DataType::I32 | DataType::U32 => 4,
            DataType::F64 | DataType::I64 => 8,
        }
    }

    /// Human-readable name.
    pub const fn name(self) -> &'static str {
        match self {
            DataType::F32 => "f32",
            DataType::F64 => "f64",
            DataType::I32 => "i32",
            DataType::I64 => "i64",
            DataType::U32 => "u32",
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A plain-old-data element that collectives can sum, cast to bytes and
/// send between workers.
pub trait Element: bytemuck::Pod + Summable + Send + Sync + 'static {
    const DTYPE: DataType;
}

impl Element for f32 {
    const DTYPE: DataType = DataType::F32;
}

impl Element for f64 {
    const DTYPE: DataType = DataType::F64;
}

impl Element for i32 {
    const DTYPE: DataType = DataType::I32;
}

impl Element for i64 {
    const DTYPE: DataType = DataType::I64;
}

impl Element for u32 {
    const DTYPE: DataType = DataType::U32;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_datatype_sizes() {
        assert_eq!(DataType::F32.size_in_bytes(), 4);
        assert_eq!(DataType::F64.size_in_bytes(), 8);
        assert_eq!(DataType::I32.size_in_bytes(), 4);
        assert_eq!(DataType::I64.size_in_bytes(), 8);
        assert_eq!(DataType::U32.size_in_bytes(), 4);
    }

    #[test]
    fn test_element_dtype_matches_size() {
        assert_eq!(f32::DTYPE.size_in_bytes(), std::mem::size_of::<f32>());
        assert_eq!(f64::DTYPE.size_in_bytes(), std::mem::size_of::<f64>());
        assert_eq!(i32::DTYPE.size_in_bytes(), std::mem::size_of::<i32>());
        assert_eq!(i64::DTYPE.size_in_bytes(), std::mem::size_of::<i64>());
        assert_eq!(u32::DTYPE.size_in_bytes(), std::mem::size_of::<u32>());
    }

    #[test]
    fn test_datatype_display() {
        assert_eq!(DataType::F32.to_string(), "f32");
        assert_eq!(DataType::I64.to_string(), "i64");
    }
}
