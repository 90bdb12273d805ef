//! Exact 18-decimal wei arithmetic.
//!
//! Amounts cross the wire and the ledger as decimal strings; all arithmetic
//! happens on 256-bit integers. Conversion never goes through native floating
//! point. The one deliberate exception is swarm contribution scaling, which
//! is approximate by design (see [`contribution_to_scaled`]).

use alloy_primitives::U256;

/// Number of fractional digits in the wei convention.
pub const WEI_DECIMALS: usize = 18;

/// `10^18`, one whole token in wei.
pub const WEI_PER_TOKEN: U256 = U256::from_limbs([1_000_000_000_000_000_000, 0, 0, 0]);

/// Fixed-point scale for swarm contributions (`10^9`).
pub const CONTRIBUTION_SCALE: u64 = 1_000_000_000;

/// Largest contribution value accepted (`2^53`, the f64 exact-integer bound).
pub const MAX_CONTRIBUTION: f64 = 9_007_199_254_740_992.0;

/// Errors from decimal-string conversion and amount validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WeiError {
    /// Input is not a plain non-negative decimal number.
    #[error("malformed amount: {0:?}")]
    Malformed(String),

    /// Negative amounts are not representable in wei.
    #[error("negative amount: {0:?}")]
    Negative(String),

    /// More than 18 fractional digits.
    #[error("too many decimal places: {got} (max {WEI_DECIMALS})")]
    TooManyDecimals {
        /// Number of fractional digits supplied.
        got: usize,
    },

    /// Value does not fit in 256 bits.
    #[error("amount overflows 256 bits")]
    Overflow,

    /// Amount must be strictly positive.
    #[error("amount must be positive: {0:?}")]
    NotPositive(String),

    /// Milestone amounts do not sum to the escrow total.
    #[error("milestone amounts sum to {got} wei, expected {expected} wei")]
    MilestoneSumMismatch {
        /// The escrow total, in wei.
        expected: String,
        /// The milestone sum, in wei.
        got: String,
    },

    /// Contribution is NaN or infinite.
    #[error("contribution is not finite")]
    NonFiniteContribution,

    /// Contribution is negative.
    #[error("contribution is negative")]
    NegativeContribution,

    /// Contribution exceeds the f64 exact-integer range.
    #[error("contribution exceeds 2^53")]
    ContributionTooLarge,
}

/// Parse a non-negative decimal string into wei.
///
/// Accepts `"123"` and `"123.456"` forms with at most 18 fractional digits.
/// Rejects signs, exponents, empty parts, and anything else.
pub fn to_wei(s: &str) -> Result<U256, WeiError> {
    if s.starts_with('-') {
        return Err(WeiError::Negative(s.to_owned()));
    }

    let (int_part, frac_part) = match s.split_once('.') {
        Some((i, f)) => (i, f),
        None => (s, ""),
    };

    if int_part.is_empty() || !int_part.bytes().all(|b| b.is_ascii_digit()) {
        return Err(WeiError::Malformed(s.to_owned()));
    }
    if s.contains('.') && (frac_part.is_empty() || !frac_part.bytes().all(|b| b.is_ascii_digit()))
    {
        return Err(WeiError::Malformed(s.to_owned()));
    }
    if frac_part.len() > WEI_DECIMALS {
        return Err(WeiError::TooManyDecimals {
            got: frac_part.len(),
        });
    }

    let int = U256::from_str_radix(int_part, 10).map_err(|_| WeiError::Overflow)?;

    let mut frac = U256::ZERO;
    if !frac_part.is_empty() {
        // Right-pad the fraction to 18 digits: "5" means 5 * 10^17 wei.
        let scale = U256::from(10u64).pow(U256::from((WEI_DECIMALS - frac_part.len()) as u64));
        frac = U256::from_str_radix(frac_part, 10)
            .map_err(|_| WeiError::Overflow)?
            .checked_mul(scale)
            .ok_or(WeiError::Overflow)?;
    }

    int.checked_mul(WEI_PER_TOKEN)
        .and_then(|v| v.checked_add(frac))
        .ok_or(WeiError::Overflow)
}

/// Emit the canonical decimal string for a wei value.
///
/// No trailing fractional zeros, no trailing dot, single `0` integer part.
pub fn from_wei(n: U256) -> String {
    let (int, frac) = n.div_rem(WEI_PER_TOKEN);
    if frac.is_zero() {
        return int.to_string();
    }

    let frac = format!("{:0>18}", frac.to_string());
    let frac = frac.trim_end_matches('0');
    format!("{int}.{frac}")
}

/// Parse an amount and require it to be strictly positive.
pub fn to_wei_positive(s: &str) -> Result<U256, WeiError> {
    let wei = to_wei(s)?;
    if wei.is_zero() {
        return Err(WeiError::NotPositive(s.to_owned()));
    }
    Ok(wei)
}

/// Sum a sequence of decimal amounts in wei.
pub fn sum_wei<'a, I>(amounts: I) -> Result<U256, WeiError>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut total = U256::ZERO;
    for amount in amounts {
        total = total
            .checked_add(to_wei(amount)?)
            .ok_or(WeiError::Overflow)?;
    }
    Ok(total)
}

/// Check that milestone amounts sum exactly to the escrow total.
pub fn validate_milestones_total<'a, I>(amounts: I, total: &str) -> Result<(), WeiError>
where
    I: IntoIterator<Item = &'a str>,
{
    let expected = to_wei(total)?;
    let got = sum_wei(amounts)?;
    if got != expected {
        return Err(WeiError::MilestoneSumMismatch {
            expected: expected.to_string(),
            got: got.to_string(),
        });
    }
    Ok(())
}

/// Scale a swarm contribution to a fixed-point integer weight.
///
/// Multiplies by `10^9` and floors. The float multiply makes this
/// approximate for contributions with more than 9 significant fractional
/// digits; the pro-rata split downstream is exact integer arithmetic over
/// these weights, so the approximation only affects the weights themselves.
pub fn contribution_to_scaled(contribution: f64) -> Result<U256, WeiError> {
    if !contribution.is_finite() {
        return Err(WeiError::NonFiniteContribution);
    }
    if contribution < 0.0 {
        return Err(WeiError::NegativeContribution);
    }
    if contribution > MAX_CONTRIBUTION {
        return Err(WeiError::ContributionTooLarge);
    }
    Ok(U256::from(
        (contribution * CONTRIBUTION_SCALE as f64).floor() as u128,
    ))
}
