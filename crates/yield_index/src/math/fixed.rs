//! 1e18 fixed-point numbers: unsigned `Wad` for balances/indices, signed `Rate` for yields.

use primitive_types::U256;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const WAD_DECIMALS: usize = 18;
pub const WAD_SCALE: u128 = 1_000_000_000_000_000_000;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MathError {
    #[error("fixed-point overflow")]
    Overflow,
    #[error("fixed-point underflow")]
    Underflow,
    #[error("division by zero")]
    DivisionByZero,
    #[error("invalid decimal: {0}")]
    Parse(String),
    #[error("invalid rate: {0}")]
    InvalidRate(String),
}

fn narrow(v: U256) -> Result<u128, MathError> {
    if v > U256::from(u128::MAX) {
        return Err(MathError::Overflow);
    }
    Ok(v.as_u128())
}

/// `a * b / d`, rounded down, on 256-bit intermediates.
fn mul_div_u128(a: u128, b: u128, d: u128) -> Result<u128, MathError> {
    if d == 0 {
        return Err(MathError::DivisionByZero);
    }
    narrow(U256::from(a) * U256::from(b) / U256::from(d))
}

/// Unsigned fixed-point value with 18 decimals.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Wad(u128);

impl Wad {
    pub const ZERO: Wad = Wad(0);
    pub const ONE: Wad = Wad(WAD_SCALE);

    pub const fn from_raw(raw: u128) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u128 {
        self.0
    }

    pub fn from_int(n: u64) -> Self {
        // u64::MAX * 1e18 < u128::MAX
        Self(u128::from(n) * WAD_SCALE)
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, other: Wad) -> Result<Wad, MathError> {
        self.0
            .checked_add(other.0)
            .map(Wad)
            .ok_or(MathError::Overflow)
    }

    pub fn checked_sub(self, other: Wad) -> Result<Wad, MathError> {
        self.0
            .checked_sub(other.0)
            .map(Wad)
            .ok_or(MathError::Underflow)
    }

    pub fn saturating_sub(self, other: Wad) -> Wad {
        Wad(self.0.saturating_sub(other.0))
    }

    /// `self * other`, rounded down.
    pub fn wad_mul(self, other: Wad) -> Result<Wad, MathError> {
        mul_div_u128(self.0, other.0, WAD_SCALE).map(Wad)
    }

    /// `self / other`, rounded down.
    pub fn wad_div(self, other: Wad) -> Result<Wad, MathError> {
        mul_div_u128(self.0, WAD_SCALE, other.0).map(Wad)
    }

    /// `self * num / den` with a single rounding step.
    pub fn mul_div(self, num: Wad, den: Wad) -> Result<Wad, MathError> {
        mul_div_u128(self.0, num.0, den.0).map(Wad)
    }

    /// `(w1*v1 + w2*v2) / (w1 + w2)` with a single rounding step.
    pub fn weighted_mean(w1: Wad, v1: Wad, w2: Wad, v2: Wad) -> Result<Wad, MathError> {
        Self::weighted_average([(w1, v1), (w2, v2)])
    }

    /// `Σ(w·v) / Σw` over `(weight, value)` pairs, rounded once at the end.
    pub fn weighted_average<I>(pairs: I) -> Result<Wad, MathError>
    where
        I: IntoIterator<Item = (Wad, Wad)>,
    {
        let mut num = U256::zero();
        let mut den = U256::zero();
        for (w, v) in pairs {
            let term = U256::from(w.0)
                .checked_mul(U256::from(v.0))
                .ok_or(MathError::Overflow)?;
            num = num.checked_add(term).ok_or(MathError::Overflow)?;
            den = den.checked_add(U256::from(w.0)).ok_or(MathError::Overflow)?;
        }
        if den.is_zero() {
            return Err(MathError::DivisionByZero);
        }
        narrow(num / den).map(Wad)
    }

    /// Integer power by squaring. Each step rounds down.
    pub fn powi(self, mut exp: u32) -> Result<Wad, MathError> {
        let mut base = self;
        let mut acc = Wad::ONE;
        while exp > 0 {
            if exp & 1 == 1 {
                acc = acc.wad_mul(base)?;
            }
            exp >>= 1;
            if exp > 0 {
                base = base.wad_mul(base)?;
            }
        }
        Ok(acc)
    }
}

/// Signed fixed-point value with 18 decimals. Used for percentages and rates,
/// which an untrusted feed may report as negative.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Rate(i128);

impl Rate {
    pub const ZERO: Rate = Rate(0);
    pub const ONE: Rate = Rate(WAD_SCALE as i128);

    pub const fn from_raw(raw: i128) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> i128 {
        self.0
    }

    pub fn from_int(n: i64) -> Self {
        Self(i128::from(n) * WAD_SCALE as i128)
    }

    pub fn from_wad(w: Wad) -> Result<Rate, MathError> {
        i128::try_from(w.raw())
            .map(Rate)
            .map_err(|_| MathError::Overflow)
    }

    /// Non-negative rates convert back to `Wad`.
    pub fn to_wad(self) -> Result<Wad, MathError> {
        u128::try_from(self.0)
            .map(Wad)
            .map_err(|_| MathError::Underflow)
    }

    pub fn is_negative(self) -> bool {
        self.0 < 0
    }

    pub fn checked_add(self, other: Rate) -> Result<Rate, MathError> {
        self.0
            .checked_add(other.0)
            .map(Rate)
            .ok_or(MathError::Overflow)
    }

    pub fn checked_sub(self, other: Rate) -> Result<Rate, MathError> {
        self.0
            .checked_sub(other.0)
            .map(Rate)
            .ok_or(MathError::Overflow)
    }

    /// `self * other`, truncated toward zero.
    pub fn rate_mul(self, other: Rate) -> Result<Rate, MathError> {
        let magnitude = mul_div_u128(self.0.unsigned_abs(), other.0.unsigned_abs(), WAD_SCALE)?;
        Self::signed(magnitude, (self.0 < 0) != (other.0 < 0))
    }

    pub fn mul_int(self, n: i128) -> Result<Rate, MathError> {
        self.0.checked_mul(n).map(Rate).ok_or(MathError::Overflow)
    }

    pub fn div_int(self, n: i128) -> Result<Rate, MathError> {
        if n == 0 {
            return Err(MathError::DivisionByZero);
        }
        Ok(Rate(self.0 / n))
    }

    fn signed(magnitude: u128, negative: bool) -> Result<Rate, MathError> {
        let v = i128::try_from(magnitude).map_err(|_| MathError::Overflow)?;
        Ok(Rate(if negative { -v } else { v }))
    }
}

fn parse_scaled(input: &str) -> Result<(bool, u128), MathError> {
    let s = input.trim();
    let (negative, body) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    let (int_part, frac_part) = match body.split_once('.') {
        Some((i, f)) => (i, f),
        None => (body, ""),
    };
    let digits_ok = |p: &str| p.bytes().all(|b| b.is_ascii_digit());
    if (int_part.is_empty() && frac_part.is_empty()) || !digits_ok(int_part) || !digits_ok(frac_part)
    {
        return Err(MathError::Parse(input.to_string()));
    }
    let int_value: u128 = if int_part.is_empty() {
        0
    } else {
        int_part
            .parse()
            .map_err(|_| MathError::Parse(input.to_string()))?
    };
    // digits beyond 18 decimals are truncated
    let mut frac = String::from(&frac_part[..frac_part.len().min(WAD_DECIMALS)]);
    while frac.len() < WAD_DECIMALS {
        frac.push('0');
    }
    let frac_value: u128 = frac
        .parse()
        .map_err(|_| MathError::Parse(input.to_string()))?;
    let raw = int_value
        .checked_mul(WAD_SCALE)
        .and_then(|v| v.checked_add(frac_value))
        .ok_or(MathError::Overflow)?;
    Ok((negative && raw != 0, raw))
}

fn fmt_scaled(f: &mut fmt::Formatter<'_>, negative: bool, raw: u128) -> fmt::Result {
    let int_part = raw / WAD_SCALE;
    let frac = format!("{:018}", raw % WAD_SCALE);
    let frac = match f.precision() {
        Some(p) => frac[..p.min(WAD_DECIMALS)].to_string(),
        None => frac.trim_end_matches('0').to_string(),
    };
    let sign = if negative { "-" } else { "" };
    if frac.is_empty() {
        write!(f, "{sign}{int_part}")
    } else {
        write!(f, "{sign}{int_part}.{frac}")
    }
}

impl fmt::Display for Wad {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_scaled(f, false, self.0)
    }
}

impl fmt::Display for Rate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_scaled(f, self.0 < 0, self.0.unsigned_abs())
    }
}

impl FromStr for Wad {
    type Err = MathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match parse_scaled(s)? {
            (true, _) => Err(MathError::Parse(format!("negative value: {s}"))),
            (false, raw) => Ok(Wad(raw)),
        }
    }
}

impl FromStr for Rate {
    type Err = MathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (negative, raw) = parse_scaled(s)?;
        Rate::signed(raw, negative)
    }
}

impl Serialize for Wad {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl Serialize for Rate {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Accepts decimal strings and JSON numbers. Floats are read through their
/// shortest decimal form, so `5.2` parses as exactly `5.2`.
struct DecimalVisitor<T>(std::marker::PhantomData<T>);

impl<T> Visitor<'_> for DecimalVisitor<T>
where
    T: FromStr<Err = MathError>,
{
    type Value = T;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a decimal string or number")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<T, E> {
        v.parse().map_err(E::custom)
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<T, E> {
        self.visit_str(&v.to_string())
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<T, E> {
        self.visit_str(&v.to_string())
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<T, E> {
        if !v.is_finite() {
            return Err(E::custom("non-finite number"));
        }
        self.visit_str(&v.to_string())
    }
}

impl<'de> Deserialize<'de> for Wad {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(DecimalVisitor(std::marker::PhantomData))
    }
}

impl<'de> Deserialize<'de> for Rate {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(DecimalVisitor(std::marker::PhantomData))
    }
}
