//! Integer-cent arithmetic and exact rationals.
//!
//! Every monetary quantity in the engine is an `i64` denominated in cents.
//! Rates, haircuts, thresholds, and multipliers are exact rationals fixed
//! at scenario-validation time, so that settlement, cost accrual, and
//! policy evaluation never touch floating point. The only float code in
//! the crate lives in arrival-distribution sampling.

use serde::de::{self, MapAccess, Visitor};
use serde::ser::SerializeStruct;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use thiserror::Error;

/// Errors raised by checked cent/rational arithmetic.
///
/// These are invariant-class failures: the engine treats any of them as
/// fatal to the current tick.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArithmeticError {
    #[error("i64 overflow in money arithmetic")]
    Overflow,

    #[error("division by zero")]
    DivisionByZero,

    #[error("rational does not fit in i64/i64 after reduction")]
    RatioOverflow,
}

/// Checked addition of two cent amounts.
pub fn add_cents(a: i64, b: i64) -> Result<i64, ArithmeticError> {
    a.checked_add(b).ok_or(ArithmeticError::Overflow)
}

/// Checked subtraction of two cent amounts.
pub fn sub_cents(a: i64, b: i64) -> Result<i64, ArithmeticError> {
    a.checked_sub(b).ok_or(ArithmeticError::Overflow)
}

fn gcd128(mut a: i128, mut b: i128) -> i128 {
    a = a.abs();
    b = b.abs();
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    if a == 0 {
        1
    } else {
        a
    }
}

/// An exact rational with reduced `i64` numerator/denominator.
///
/// Invariants: `den > 0`, `gcd(num, den) == 1`. All arithmetic goes
/// through `i128` intermediates and fails loudly on overflow instead of
/// losing precision. Integer cents embed losslessly via [`Ratio::from_int`],
/// so comparisons between cent amounts are exact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ratio {
    num: i64,
    den: i64,
}

impl Ratio {
    pub const ZERO: Ratio = Ratio { num: 0, den: 1 };
    pub const ONE: Ratio = Ratio { num: 1, den: 1 };

    /// Build a reduced rational. `den` must be non-zero.
    pub fn new(num: i64, den: i64) -> Result<Self, ArithmeticError> {
        if den == 0 {
            return Err(ArithmeticError::DivisionByZero);
        }
        Self::reduce(num as i128, den as i128)
    }

    pub fn from_int(v: i64) -> Self {
        Ratio { num: v, den: 1 }
    }

    fn reduce(num: i128, den: i128) -> Result<Self, ArithmeticError> {
        debug_assert!(den != 0);
        let sign = if den < 0 { -1 } else { 1 };
        let g = gcd128(num, den);
        let num = sign * num / g;
        let den = sign * den / g;
        let num = i64::try_from(num).map_err(|_| ArithmeticError::RatioOverflow)?;
        let den = i64::try_from(den).map_err(|_| ArithmeticError::RatioOverflow)?;
        Ok(Ratio { num, den })
    }

    pub fn num(&self) -> i64 {
        self.num
    }

    pub fn den(&self) -> i64 {
        self.den
    }

    pub fn is_zero(&self) -> bool {
        self.num == 0
    }

    pub fn is_negative(&self) -> bool {
        self.num < 0
    }

    pub fn is_integer(&self) -> bool {
        self.den == 1
    }

    /// The integer value, if this rational is one.
    pub fn as_int(&self) -> Option<i64> {
        if self.den == 1 {
            Some(self.num)
        } else {
            None
        }
    }

    pub fn checked_add(self, other: Ratio) -> Result<Ratio, ArithmeticError> {
        let num =
            self.num as i128 * other.den as i128 + other.num as i128 * self.den as i128;
        Self::reduce(num, self.den as i128 * other.den as i128)
    }

    pub fn checked_sub(self, other: Ratio) -> Result<Ratio, ArithmeticError> {
        let num =
            self.num as i128 * other.den as i128 - other.num as i128 * self.den as i128;
        Self::reduce(num, self.den as i128 * other.den as i128)
    }

    pub fn checked_mul(self, other: Ratio) -> Result<Ratio, ArithmeticError> {
        Self::reduce(
            self.num as i128 * other.num as i128,
            self.den as i128 * other.den as i128,
        )
    }

    pub fn checked_div(self, other: Ratio) -> Result<Ratio, ArithmeticError> {
        if other.num == 0 {
            return Err(ArithmeticError::DivisionByZero);
        }
        Self::reduce(
            self.num as i128 * other.den as i128,
            self.den as i128 * other.num as i128,
        )
    }

    /// Largest integer <= self.
    pub fn floor(&self) -> i64 {
        (self.num as i128).div_euclid(self.den as i128) as i64
    }

    /// Smallest integer >= self.
    pub fn ceil(&self) -> i64 {
        -((-(self.num as i128)).div_euclid(self.den as i128)) as i64
    }

    /// Nearest integer, halves away from zero.
    pub fn round(&self) -> i64 {
        let n = self.num as i128;
        let d = self.den as i128;
        let twice = 2 * n;
        if n >= 0 {
            ((twice + d) / (2 * d)) as i64
        } else {
            ((twice - d) / (2 * d)) as i64
        }
    }

    pub fn abs(self) -> Ratio {
        Ratio {
            num: self.num.abs(),
            den: self.den,
        }
    }

    /// `trunc(amount * self)` — the cent-rounding rule of the engine
    /// (truncation toward zero).
    pub fn mul_trunc(&self, amount: i64) -> Result<i64, ArithmeticError> {
        let v = amount as i128 * self.num as i128 / self.den as i128;
        i64::try_from(v).map_err(|_| ArithmeticError::Overflow)
    }

    /// Exact comparison via `i128` cross-multiplication.
    fn cmp_exact(&self, other: &Ratio) -> Ordering {
        let lhs = self.num as i128 * other.den as i128;
        let rhs = other.num as i128 * self.den as i128;
        lhs.cmp(&rhs)
    }

    /// Parse a plain decimal string ("12", "-0.8", "0.0001") into an
    /// exact rational. Used to map JSON float literals onto the rational
    /// the author wrote, rather than onto the nearest binary double.
    pub fn from_decimal_str(s: &str) -> Option<Ratio> {
        let s = s.trim();
        let (sign, body) = match s.strip_prefix('-') {
            Some(rest) => (-1i64, rest),
            None => (1i64, s),
        };
        if body.is_empty() {
            return None;
        }
        let (int_part, frac_part) = match body.split_once('.') {
            Some((i, f)) => (i, f),
            None => (body, ""),
        };
        if !int_part.chars().all(|c| c.is_ascii_digit())
            || !frac_part.chars().all(|c| c.is_ascii_digit())
            || (int_part.is_empty() && frac_part.is_empty())
        {
            return None;
        }
        if frac_part.len() > 18 {
            return None;
        }
        let int_val: i128 = if int_part.is_empty() {
            0
        } else {
            int_part.parse().ok()?
        };
        let frac_val: i128 = if frac_part.is_empty() {
            0
        } else {
            frac_part.parse().ok()?
        };
        let den: i128 = 10i128.checked_pow(frac_part.len() as u32)?;
        let num = (int_val.checked_mul(den)?).checked_add(frac_val)? * sign as i128;
        Ratio::reduce(num, den).ok()
    }
}

impl Default for Ratio {
    fn default() -> Self {
        Ratio::ZERO
    }
}

impl PartialOrd for Ratio {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Ratio {
    fn cmp(&self, other: &Self) -> Ordering {
        self.cmp_exact(other)
    }
}

impl fmt::Display for Ratio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.den == 1 {
            write!(f, "{}", self.num)
        } else {
            write!(f, "{}/{}", self.num, self.den)
        }
    }
}

impl Serialize for Ratio {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if self.den == 1 {
            serializer.serialize_i64(self.num)
        } else {
            let mut s = serializer.serialize_struct("Ratio", 2)?;
            s.serialize_field("num", &self.num)?;
            s.serialize_field("den", &self.den)?;
            s.end()
        }
    }
}

struct RatioVisitor;

impl<'de> Visitor<'de> for RatioVisitor {
    type Value = Ratio;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("an integer, a decimal number, or {\"num\": .., \"den\": ..}")
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Ratio, E> {
        Ok(Ratio::from_int(v))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Ratio, E> {
        i64::try_from(v)
            .map(Ratio::from_int)
            .map_err(|_| E::custom("integer out of i64 range"))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<Ratio, E> {
        // Route through the shortest decimal form so "0.8" means exactly
        // 8/10, not the nearest binary double.
        if !v.is_finite() {
            return Err(E::custom("non-finite number"));
        }
        let rendered = format!("{}", v);
        Ratio::from_decimal_str(&rendered)
            .ok_or_else(|| E::custom(format!("cannot express {} as an exact rational", v)))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Ratio, A::Error> {
        let mut num: Option<i64> = None;
        let mut den: Option<i64> = None;
        while let Some(key) = map.next_key::<String>()? {
            match key.as_str() {
                "num" => num = Some(map.next_value()?),
                "den" => den = Some(map.next_value()?),
                other => return Err(de::Error::unknown_field(other, &["num", "den"])),
            }
        }
        let num = num.ok_or_else(|| de::Error::missing_field("num"))?;
        let den = den.ok_or_else(|| de::Error::missing_field("den"))?;
        Ratio::new(num, den).map_err(de::Error::custom)
    }
}

impl<'de> Deserialize<'de> for Ratio {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(RatioVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reduction_and_sign() {
        let r = Ratio::new(4, -10).unwrap();
        assert_eq!((r.num(), r.den()), (-2, 5));
        assert_eq!(Ratio::new(0, 7).unwrap(), Ratio::ZERO);
    }

    #[test]
    fn exact_comparison() {
        let a = Ratio::new(1, 3).unwrap();
        let b = Ratio::new(333_333_333, 1_000_000_000).unwrap();
        assert!(a > b);
        assert_eq!(Ratio::from_int(5), Ratio::new(10, 2).unwrap());
    }

    #[test]
    fn mul_trunc_truncates_toward_zero() {
        let r = Ratio::new(1, 3).unwrap();
        assert_eq!(r.mul_trunc(10).unwrap(), 3);
        assert_eq!(r.mul_trunc(-10).unwrap(), -3);
    }

    #[test]
    fn floor_ceil_round() {
        let r = Ratio::new(-7, 2).unwrap();
        assert_eq!(r.floor(), -4);
        assert_eq!(r.ceil(), -3);
        assert_eq!(r.round(), -4); // halves away from zero
        assert_eq!(Ratio::new(5, 2).unwrap().round(), 3);
    }

    #[test]
    fn decimal_parsing_is_exact() {
        assert_eq!(
            Ratio::from_decimal_str("0.8").unwrap(),
            Ratio::new(4, 5).unwrap()
        );
        assert_eq!(
            Ratio::from_decimal_str("-1.25").unwrap(),
            Ratio::new(-5, 4).unwrap()
        );
        assert!(Ratio::from_decimal_str("1e-3").is_none());
    }

    #[test]
    fn json_forms_deserialize() {
        let a: Ratio = serde_json::from_str("3").unwrap();
        assert_eq!(a, Ratio::from_int(3));
        let b: Ratio = serde_json::from_str("0.5").unwrap();
        assert_eq!(b, Ratio::new(1, 2).unwrap());
        let c: Ratio = serde_json::from_str(r#"{"num": 2, "den": 8}"#).unwrap();
        assert_eq!(c, Ratio::new(1, 4).unwrap());
    }

    #[test]
    fn checked_ops() {
        let third = Ratio::new(1, 3).unwrap();
        let half = Ratio::new(1, 2).unwrap();
        assert_eq!(third.checked_add(half).unwrap(), Ratio::new(5, 6).unwrap());
        assert_eq!(half.checked_div(third).unwrap(), Ratio::new(3, 2).unwrap());
        assert_eq!(
            half.checked_div(Ratio::ZERO),
            Err(ArithmeticError::DivisionByZero)
        );
    }
}
