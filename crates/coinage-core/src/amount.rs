//! Fixed-point currency amounts
//!
//! An amount is an integer value plus a fraction in units of
//! 1/[`FRACTION_BASE`], bound to a currency code. Binary layout (24 bytes):
//!
//! ```text
//! OFFSET  SIZE  FIELD
//! 0x00    8     value (big endian)
//! 0x08    4     fraction (big endian)
//! 0x0C    12    currency (ASCII, NUL padded)
//! ```

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{CoreError, Result};

/// Fractional units per whole unit
pub const FRACTION_BASE: u32 = 100_000_000;

/// Number of decimal digits in the fraction
pub const FRACTION_DIGITS: usize = 8;

/// Largest permitted integer value (2^52)
pub const MAX_AMOUNT_VALUE: u64 = 1 << 52;

/// Bytes reserved for the currency code, including the terminator
pub const CURRENCY_LEN: usize = 12;

/// Size of the binary amount encoding
pub const AMOUNT_BYTES: usize = 24;

/// Currency code: 1 to 11 uppercase ASCII letters
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Currency([u8; CURRENCY_LEN]);

impl Currency {
    /// Validate and pack a currency code
    pub fn new(code: &str) -> Result<Self> {
        if code.is_empty() || code.len() >= CURRENCY_LEN {
            return Err(CoreError::InvalidAmount(format!(
                "currency code length {} out of range",
                code.len()
            )));
        }
        if !code.bytes().all(|b| b.is_ascii_uppercase()) {
            return Err(CoreError::InvalidAmount(format!(
                "currency code '{}' must be uppercase ASCII letters",
                code
            )));
        }
        let mut bytes = [0u8; CURRENCY_LEN];
        bytes[..code.len()].copy_from_slice(code.as_bytes());
        Ok(Self(bytes))
    }

    /// The currency code as a string slice
    pub fn as_str(&self) -> &str {
        let end = self.0.iter().position(|b| *b == 0).unwrap_or(CURRENCY_LEN);
        // Construction only admits ASCII letters
        std::str::from_utf8(&self.0[..end]).unwrap_or("")
    }

    /// Padded wire bytes
    pub fn as_bytes(&self) -> &[u8; CURRENCY_LEN] {
        &self.0
    }

    fn from_bytes(bytes: &[u8; CURRENCY_LEN]) -> Result<Self> {
        let end = bytes.iter().position(|b| *b == 0).ok_or_else(|| {
            CoreError::InvalidAmount("currency code is not NUL terminated".to_string())
        })?;
        if bytes[end..].iter().any(|b| *b != 0) {
            return Err(CoreError::InvalidAmount(
                "currency padding is not zero".to_string(),
            ));
        }
        let code = std::str::from_utf8(&bytes[..end])
            .map_err(|e| CoreError::InvalidAmount(e.to_string()))?;
        Self::new(code)
    }
}

impl fmt::Debug for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Currency({})", self.as_str())
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A currency amount with 10^-8 resolution
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Amount {
    value: u64,
    fraction: u32,
    currency: Currency,
}

impl Amount {
    /// Build an amount, rejecting out-of-range components
    pub fn new(currency: &str, value: u64, fraction: u32) -> Result<Self> {
        let currency = Currency::new(currency)?;
        Self::from_parts(currency, value, fraction)
    }

    fn from_parts(currency: Currency, value: u64, fraction: u32) -> Result<Self> {
        if fraction >= FRACTION_BASE {
            return Err(CoreError::InvalidAmount(format!(
                "fraction {} not below {}",
                fraction, FRACTION_BASE
            )));
        }
        if value > MAX_AMOUNT_VALUE {
            return Err(CoreError::AmountOverflow);
        }
        Ok(Self {
            value,
            fraction,
            currency,
        })
    }

    /// Zero in the given currency
    pub fn zero(currency: Currency) -> Self {
        Self {
            value: 0,
            fraction: 0,
            currency,
        }
    }

    pub fn value(&self) -> u64 {
        self.value
    }

    pub fn fraction(&self) -> u32 {
        self.fraction
    }

    pub fn currency(&self) -> Currency {
        self.currency
    }

    pub fn is_zero(&self) -> bool {
        self.value == 0 && self.fraction == 0
    }

    fn ensure_same_currency(&self, other: &Amount) -> Result<()> {
        if self.currency != other.currency {
            return Err(CoreError::CurrencyMismatch {
                left: self.currency.to_string(),
                right: other.currency.to_string(),
            });
        }
        Ok(())
    }

    /// Overflow-checked addition
    pub fn checked_add(&self, other: &Amount) -> Result<Amount> {
        self.ensure_same_currency(other)?;
        let mut fraction = self.fraction + other.fraction;
        let mut carry = 0u64;
        if fraction >= FRACTION_BASE {
            fraction -= FRACTION_BASE;
            carry = 1;
        }
        let value = self
            .value
            .checked_add(other.value)
            .and_then(|v| v.checked_add(carry))
            .ok_or(CoreError::AmountOverflow)?;
        if value > MAX_AMOUNT_VALUE {
            return Err(CoreError::AmountOverflow);
        }
        Ok(Amount {
            value,
            fraction,
            currency: self.currency,
        })
    }

    /// Subtraction that refuses to go below zero
    pub fn checked_sub(&self, other: &Amount) -> Result<Amount> {
        self.ensure_same_currency(other)?;
        let (mut value, fraction) = if self.fraction >= other.fraction {
            (self.value, self.fraction - other.fraction)
        } else {
            let value = self.value.checked_sub(1).ok_or(CoreError::AmountNegative)?;
            (value, self.fraction + FRACTION_BASE - other.fraction)
        };
        value = value
            .checked_sub(other.value)
            .ok_or(CoreError::AmountNegative)?;
        Ok(Amount {
            value,
            fraction,
            currency: self.currency,
        })
    }

    /// Subtraction clamped at zero
    pub fn saturating_sub(&self, other: &Amount) -> Result<Amount> {
        match self.checked_sub(other) {
            Err(CoreError::AmountNegative) => Ok(Amount::zero(self.currency)),
            result => result,
        }
    }

    /// Compare two amounts of the same currency
    pub fn compare(&self, other: &Amount) -> Result<Ordering> {
        self.ensure_same_currency(other)?;
        Ok((self.value, self.fraction).cmp(&(other.value, other.fraction)))
    }

    /// Sum a sequence of amounts, starting from zero in `currency`
    pub fn sum<'a, I>(currency: Currency, amounts: I) -> Result<Amount>
    where
        I: IntoIterator<Item = &'a Amount>,
    {
        amounts
            .into_iter()
            .try_fold(Amount::zero(currency), |acc, a| acc.checked_add(a))
    }

    /// Multiply by a small integer factor
    pub fn checked_mul(&self, factor: u32) -> Result<Amount> {
        let total_fraction = self.fraction as u64 * factor as u64;
        let carry = total_fraction / FRACTION_BASE as u64;
        let fraction = (total_fraction % FRACTION_BASE as u64) as u32;
        let value = self
            .value
            .checked_mul(factor as u64)
            .and_then(|v| v.checked_add(carry))
            .ok_or(CoreError::AmountOverflow)?;
        Self::from_parts(self.currency, value, fraction)
    }

    /// Network byte order encoding
    pub fn to_bytes(&self) -> [u8; AMOUNT_BYTES] {
        let mut bytes = [0u8; AMOUNT_BYTES];
        bytes[0x00..0x08].copy_from_slice(&self.value.to_be_bytes());
        bytes[0x08..0x0C].copy_from_slice(&self.fraction.to_be_bytes());
        bytes[0x0C..0x18].copy_from_slice(self.currency.as_bytes());
        bytes
    }

    /// Decode the network byte order encoding
    pub fn from_bytes(bytes: &[u8; AMOUNT_BYTES]) -> Result<Self> {
        let mut value = [0u8; 8];
        value.copy_from_slice(&bytes[0x00..0x08]);
        let mut fraction = [0u8; 4];
        fraction.copy_from_slice(&bytes[0x08..0x0C]);
        let mut currency = [0u8; CURRENCY_LEN];
        currency.copy_from_slice(&bytes[0x0C..0x18]);

        Self::from_parts(
            Currency::from_bytes(&currency)?,
            u64::from_be_bytes(value),
            u32::from_be_bytes(fraction),
        )
    }
}

impl PartialOrd for Amount {
    /// Amounts in different currencies are unordered
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        self.compare(other).ok()
    }
}

impl FromStr for Amount {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        let (currency, number) = s
            .split_once(':')
            .ok_or_else(|| CoreError::InvalidAmount(format!("missing ':' in '{}'", s)))?;
        let currency = Currency::new(currency)?;

        let (whole, frac) = match number.split_once('.') {
            Some((w, f)) => (w, f),
            None => (number, ""),
        };
        if whole.is_empty() || !whole.bytes().all(|b| b.is_ascii_digit()) {
            return Err(CoreError::InvalidAmount(format!("bad value in '{}'", s)));
        }
        if frac.len() > FRACTION_DIGITS || !frac.bytes().all(|b| b.is_ascii_digit()) {
            return Err(CoreError::InvalidAmount(format!("bad fraction in '{}'", s)));
        }
        if number.contains('.') && frac.is_empty() {
            return Err(CoreError::InvalidAmount(format!("empty fraction in '{}'", s)));
        }

        let value: u64 = whole
            .parse()
            .map_err(|_| CoreError::InvalidAmount(format!("value too large in '{}'", s)))?;
        let mut fraction = 0u32;
        let mut unit = FRACTION_BASE / 10;
        for digit in frac.bytes() {
            fraction += (digit - b'0') as u32 * unit;
            unit /= 10;
        }
        Self::from_parts(currency, value, fraction)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.currency, self.value)?;
        if self.fraction != 0 {
            let digits = format!("{:08}", self.fraction);
            write!(f, ".{}", digits.trim_end_matches('0'))?;
        }
        Ok(())
    }
}

impl fmt::Debug for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Amount({})", self)
    }
}

impl Serialize for Amount {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
