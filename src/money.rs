use serde::{Deserialize, Serialize};

/// Fractional digits carried by USD amounts. Stored as integer micro-dollars.
pub const USD_SCALE: u32 = 6;
/// Fractional digits carried by price multipliers.
pub const MULTIPLIER_SCALE: u32 = 6;
/// Fractional digits carried by CNY amounts (purchase-order display side).
pub const CNY_SCALE: u32 = 2;

const USD_UNIT: i64 = 1_000_000;
const MULTIPLIER_UNIT: i64 = 1_000_000;
const CNY_UNIT: i64 = 100;

/// A USD amount with a fixed scale of six fractional digits.
///
/// Every lossy conversion truncates toward zero, never rounds, so a value
/// read back from storage is always exactly the value that was written.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Usd(i64);

impl Usd {
    pub const ZERO: Usd = Usd(0);

    pub const fn from_micros(micros: i64) -> Self {
        Usd(micros)
    }

    pub const fn micros(self) -> i64 {
        self.0
    }

    /// Truncates toward zero at the sixth fractional digit.
    pub fn from_f64(value: f64) -> Self {
        Usd(truncate_f64(value, USD_UNIT))
    }

    pub fn parse(raw: &str) -> Option<Self> {
        parse_fixed(raw, USD_SCALE).map(Usd)
    }

    pub fn is_negative(self) -> bool {
        self.0 < 0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, other: Usd) -> Option<Usd> {
        self.0.checked_add(other.0).map(Usd)
    }

    pub fn checked_sub(self, other: Usd) -> Option<Usd> {
        self.0.checked_sub(other.0).map(Usd)
    }

    pub fn saturating_add(self, other: Usd) -> Usd {
        Usd(self.0.saturating_add(other.0))
    }

    pub fn saturating_sub(self, other: Usd) -> Usd {
        Usd(self.0.saturating_sub(other.0))
    }

    pub fn min(self, other: Usd) -> Usd {
        Usd(self.0.min(other.0))
    }

    /// Multiplies by a price multiplier, truncating toward zero.
    pub fn apply_multiplier(self, multiplier: Multiplier) -> Usd {
        let product = i128::from(self.0) * i128::from(multiplier.micros());
        Usd((product / i128::from(MULTIPLIER_UNIT)) as i64)
    }
}

impl std::fmt::Display for Usd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{sign}{}.{:06}", abs / USD_UNIT as u64, abs % USD_UNIT as u64)
    }
}

/// A price multiplier with a fixed scale of six fractional digits.
///
/// Non-positive candidates are invalid discounts and normalize to the
/// default multiplier of 1.0 instead of propagating.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Multiplier(i64);

impl Multiplier {
    pub const DEFAULT: Multiplier = Multiplier(MULTIPLIER_UNIT);

    pub const fn from_micros(micros: i64) -> Self {
        Multiplier(micros)
    }

    pub const fn micros(self) -> i64 {
        self.0
    }

    pub fn from_f64(value: f64) -> Self {
        Multiplier(truncate_f64(value, MULTIPLIER_UNIT))
    }

    /// Replaces a non-positive multiplier with the default.
    pub fn normalized(self) -> Multiplier {
        if self.0 <= 0 { Multiplier::DEFAULT } else { self }
    }
}

impl Default for Multiplier {
    fn default() -> Self {
        Multiplier::DEFAULT
    }
}

impl std::fmt::Display for Multiplier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(
            f,
            "{sign}{}.{:06}",
            abs / MULTIPLIER_UNIT as u64,
            abs % MULTIPLIER_UNIT as u64
        )
    }
}

/// A CNY amount with a fixed scale of two fractional digits (fēn).
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Cny(i64);

impl Cny {
    pub const ZERO: Cny = Cny(0);

    pub const fn from_fen(fen: i64) -> Self {
        Cny(fen)
    }

    pub const fn fen(self) -> i64 {
        self.0
    }

    pub fn from_f64(value: f64) -> Self {
        Cny(truncate_f64(value, CNY_UNIT))
    }

    pub fn parse(raw: &str) -> Option<Self> {
        parse_fixed(raw, CNY_SCALE).map(Cny)
    }
}

impl std::fmt::Display for Cny {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{sign}{}.{:02}", abs / CNY_UNIT as u64, abs % CNY_UNIT as u64)
    }
}

fn truncate_f64(value: f64, unit: i64) -> i64 {
    if !value.is_finite() {
        return 0;
    }
    let scaled = (value * unit as f64).trunc();
    if scaled >= i64::MAX as f64 {
        i64::MAX
    } else if scaled <= i64::MIN as f64 {
        i64::MIN
    } else {
        scaled as i64
    }
}

/// Parses a plain decimal literal, keeping at most `scale` fractional digits
/// and dropping the rest without rounding.
fn parse_fixed(raw: &str, scale: u32) -> Option<i64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let (negative, digits) = match raw.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, raw.strip_prefix('+').unwrap_or(raw)),
    };
    let (int_part, frac_part) = match digits.split_once('.') {
        Some((i, f)) => (i, f),
        None => (digits, ""),
    };
    if int_part.is_empty() && frac_part.is_empty() {
        return None;
    }
    if !int_part.chars().all(|c| c.is_ascii_digit())
        || !frac_part.chars().all(|c| c.is_ascii_digit())
    {
        return None;
    }

    let unit = 10i64.checked_pow(scale)?;
    let whole: i64 = if int_part.is_empty() {
        0
    } else {
        int_part.parse().ok()?
    };
    let mut frac: i64 = 0;
    for c in frac_part.chars().take(scale as usize) {
        frac = frac * 10 + i64::from(c as u8 - b'0');
    }
    let kept = frac_part.len().min(scale as usize) as u32;
    frac *= 10i64.pow(scale - kept);

    let magnitude = whole.checked_mul(unit)?.checked_add(frac)?;
    Some(if negative { -magnitude } else { magnitude })
}
