use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::num::NonZeroU32;

pub type DimSize = NonZeroU32;
pub type Shape = Vec<DimSize>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum Dtype {
    Uint8,
    Sint8,
    Uint16,
    Sint16,
    Uint32,
    Sint32,
    Float16,
    Float32,
    Float64,
}

impl Dtype {
    /// The bytes required to represent a value of this Dtype.
    pub fn size(&self) -> u8 {
        match self {
            Dtype::Uint8 | Dtype::Sint8 => 1,
            Dtype::Uint16 | Dtype::Sint16 | Dtype::Float16 => 2,
            Dtype::Uint32 | Dtype::Sint32 | Dtype::Float32 => 4,
            Dtype::Float64 => 8,
        }
    }

    pub fn bits(&self) -> u32 {
        u32::from(self.size()) * 8
    }
}

impl Display for Dtype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Dtype::Uint8 => write!(f, "u8"),
            Dtype::Sint8 => write!(f, "i8"),
            Dtype::Uint16 => write!(f, "u16"),
            Dtype::Sint16 => write!(f, "i16"),
            Dtype::Uint32 => write!(f, "u32"),
            Dtype::Sint32 => write!(f, "i32"),
            Dtype::Float16 => write!(f, "f16"),
            Dtype::Float32 => write!(f, "f32"),
            Dtype::Float64 => write!(f, "f64"),
        }
    }
}

/// The number of elements in a tensor of the given shape.
pub fn volume(shape: &[DimSize]) -> u64 {
    shape.iter().map(|d| u64::from(d.get())).product()
}

pub mod macros {
    #[macro_export]
    macro_rules! shape {
        ($dim:expr; $n:expr) => {{
            use $crate::common::macros::internal::IntoDimSize;
            // Bind to a variable with an explicit type to help out type inference.
            let sv: $crate::common::Shape = vec![ ($dim).into_dim_size(); $n ];
            sv
        }};
        ($($dim:expr),*$(,)*) => {{
            use $crate::common::macros::internal::IntoDimSize;
            // Bind to a variable with an explicit type to help out type inference.
            let sv: $crate::common::Shape = vec![ $( ($dim).into_dim_size() ),* ];
            sv
        }};
    }

    pub mod internal {
        use crate::common::DimSize;

        pub trait IntoDimSize {
            fn into_dim_size(self) -> DimSize;
        }

        impl IntoDimSize for DimSize {
            fn into_dim_size(self) -> DimSize {
                self
            }
        }

        impl IntoDimSize for u32 {
            fn into_dim_size(self) -> DimSize {
                DimSize::new(self).unwrap()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape;
    use proptest::prelude::*;

    #[test]
    fn test_shape_macro_and_volume() {
        let s = shape![2, 3, 4, 5];
        assert_eq!(s.len(), 4);
        assert_eq!(volume(&s), 120);
        assert_eq!(shape![7u32; 3], vec![DimSize::new(7).unwrap(); 3]);
    }

    proptest! {
        #[test]
        fn test_dtype_bits_is_eight_times_size(dtype in any::<Dtype>()) {
            prop_assert_eq!(dtype.bits(), u32::from(dtype.size()) * 8);
        }
    }
}
