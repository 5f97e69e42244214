//! SecureBuffer: буфер для ключей и открытого текста.
//!
//! Содержимое затирается нулями при любом выходе из области видимости:
//! нормальный возврат, `?`, паника с раскруткой стека. Неявного копирования
//! нет (`Clone` не реализован), копия делается только через [`SecureBuffer::duplicate`]
//! и сама является `SecureBuffer`. [`SecureBuffer::wipe`] поглощает буфер,
//! поэтому повторное использование после затирания не компилируется.

use std::fmt;
use zeroize::Zeroizing;

pub struct SecureBuffer {
    bytes: Zeroizing<Vec<u8>>,
}

impl SecureBuffer {
    /// Буфер из `len` нулевых байт
    pub fn zeroed(len: usize) -> Self {
        Self {
            bytes: Zeroizing::new(vec![0u8; len]),
        }
    }

    /// Забрать владение вектором без копирования.
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Zeroizing::new(bytes),
        }
    }

    /// Явная копия из чужого среза. Исходный срез остаётся на совести вызывающего.
    pub fn copy_from_slice(bytes: &[u8]) -> Self {
        let mut buffer = Self::zeroed(bytes.len());
        buffer.bytes.copy_from_slice(bytes);
        buffer
    }

    /// Явная копия. Новый буфер затирается независимо от исходного.
    pub fn duplicate(&self) -> Self {
        Self::copy_from_slice(&self.bytes)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Затереть сейчас, не дожидаясь конца области видимости.
    pub fn wipe(self) {
        drop(self);
    }
}

impl AsRef<[u8]> for SecureBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

impl PartialEq for SecureBuffer {
    fn eq(&self, other: &Self) -> bool {
        ct_eq(&self.bytes, &other.bytes)
    }
}

impl Eq for SecureBuffer {}

impl fmt::Debug for SecureBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecureBuffer([REDACTED; {}])", self.bytes.len())
    }
}

/// Сравнение без раннего выхода по первому несовпавшему байту
fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
