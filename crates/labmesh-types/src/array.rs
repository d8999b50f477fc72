//! Reversible encoding of numeric sample arrays for the JSON wire format.
//!
//! Hardware samples (spectra, camera lines, encoder traces) would lose
//! precision or balloon in size as JSON number lists.  A [`NumericArray`]
//! carries the raw little-endian bytes instead:
//!
//! ```json
//! {"dtype": "<f8", "shape": [2, 3], "data": "AAAAAAAA8D8..."}
//! ```
//!
//! `dtype` uses the NumPy type-string convention so that non-Rust clients can
//! decode the payload with `frombuffer(b64decode(data), dtype).reshape(shape)`.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::LabError;

/// A scalar type that can be packed into a [`NumericArray`].
pub trait ArrayElement: Copy {
    /// NumPy type string, e.g. `"<f8"`.
    const DTYPE: &'static str;
    /// Size of one element in bytes.
    const SIZE: usize;

    fn write_le(self, out: &mut Vec<u8>);
    fn read_le(bytes: &[u8]) -> Self;
}

macro_rules! array_element {
    ($($ty:ty => $dtype:literal),* $(,)?) => {
        $(
            impl ArrayElement for $ty {
                const DTYPE: &'static str = $dtype;
                const SIZE: usize = std::mem::size_of::<$ty>();

                fn write_le(self, out: &mut Vec<u8>) {
                    out.extend_from_slice(&self.to_le_bytes());
                }

                fn read_le(bytes: &[u8]) -> Self {
                    let mut buf = [0u8; std::mem::size_of::<$ty>()];
                    buf.copy_from_slice(bytes);
                    <$ty>::from_le_bytes(buf)
                }
            }
        )*
    };
}

array_element! {
    f32 => "<f4",
    f64 => "<f8",
    i16 => "<i2",
    i32 => "<i4",
    i64 => "<i8",
    u8 => "|u1",
    u16 => "<u2",
    u32 => "<u4",
}

/// An n-dimensional numeric array in wire form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NumericArray {
    pub dtype: String,
    pub shape: Vec<usize>,
    /// Base64 (standard alphabet) of the little-endian element bytes.
    pub data: String,
}

impl NumericArray {
    /// Pack a one-dimensional slice.
    pub fn from_slice<T: ArrayElement>(values: &[T]) -> Self {
        Self::pack(values, vec![values.len()])
    }

    /// Pack `values` (row-major) with an explicit `shape`.
    ///
    /// # Errors
    ///
    /// Returns [`LabError::InvalidArgument`] when the product of `shape` does
    /// not match the number of values.
    pub fn with_shape<T: ArrayElement>(values: &[T], shape: Vec<usize>) -> Result<Self, LabError> {
        let expected: usize = shape.iter().product();
        if expected != values.len() {
            return Err(LabError::InvalidArgument {
                name: "shape".to_string(),
                details: format!("shape {shape:?} holds {expected} values, got {}", values.len()),
            });
        }
        Ok(Self::pack(values, shape))
    }

    fn pack<T: ArrayElement>(values: &[T], shape: Vec<usize>) -> Self {
        let mut bytes = Vec::with_capacity(values.len() * T::SIZE);
        for v in values {
            v.write_le(&mut bytes);
        }
        Self {
            dtype: T::DTYPE.to_string(),
            shape,
            data: STANDARD.encode(bytes),
        }
    }

    /// Number of elements described by `shape`.
    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Unpack into a flat row-major vector of `T`.
    ///
    /// # Errors
    ///
    /// Fails when `T` does not match `dtype`, when `data` is not valid base64
    /// or when the byte count disagrees with `shape`.
    pub fn to_vec<T: ArrayElement>(&self) -> Result<Vec<T>, LabError> {
        if self.dtype != T::DTYPE {
            return Err(LabError::Serialization(format!(
                "array dtype {} cannot be read as {}",
                self.dtype,
                T::DTYPE
            )));
        }
        let bytes = STANDARD
            .decode(&self.data)
            .map_err(|e| LabError::Serialization(format!("array data: {e}")))?;
        if bytes.len() != self.len() * T::SIZE {
            return Err(LabError::Serialization(format!(
                "array data holds {} bytes, shape {:?} needs {}",
                bytes.len(),
                self.shape,
                self.len() * T::SIZE
            )));
        }
        Ok(bytes.chunks_exact(T::SIZE).map(T::read_le).collect())
    }

    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "dtype": self.dtype,
            "shape": self.shape,
            "data": self.data,
        })
    }

    /// Recognise an encoded array inside an arbitrary JSON value.  Returns
    /// `None` for anything that is not exactly `{dtype, shape, data}`.
    pub fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        if obj.len() != 3 {
            return None;
        }
        serde_json::from_value(value.clone()).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn f64_samples_survive_exactly() {
        let samples = [0.1_f64, -1.0e-300, std::f64::consts::PI, f64::MAX];
        let arr = NumericArray::from_slice(&samples);
        assert_eq!(arr.dtype, "<f8");
        assert_eq!(arr.shape, vec![4]);
        let back: Vec<f64> = arr.to_vec().unwrap();
        assert_eq!(back, samples);
    }

    #[test]
    fn shape_is_validated() {
        let data = [1u16, 2, 3, 4, 5, 6];
        let arr = NumericArray::with_shape(&data, vec![2, 3]).unwrap();
        assert_eq!(arr.len(), 6);
        assert!(NumericArray::with_shape(&data, vec![4, 2]).is_err());
    }

    #[test]
    fn dtype_mismatch_is_rejected() {
        let arr = NumericArray::from_slice(&[1.0_f32, 2.0]);
        assert!(arr.to_vec::<f64>().is_err());
        assert_eq!(arr.to_vec::<f32>().unwrap(), vec![1.0, 2.0]);
    }

    #[test]
    fn truncated_data_is_rejected() {
        let mut arr = NumericArray::from_slice(&[1i32, 2, 3]);
        arr.shape = vec![4];
        assert!(arr.to_vec::<i32>().is_err());
    }

    #[test]
    fn value_detection() {
        let arr = NumericArray::from_slice(&[7u8, 8, 9]);
        let v = arr.to_value();
        assert_eq!(NumericArray::from_value(&v), Some(arr));
        assert_eq!(NumericArray::from_value(&serde_json::json!({"dtype": "<f8"})), None);
        assert_eq!(NumericArray::from_value(&serde_json::json!(3)), None);
    }
}
