//! Normal-distribution bonding curve for pricing one side of a market.
//!
//! The curve is the static pm-AMM invariant over reserves `x` (token 0) and
//! `y` (token 1) with liquidity `L`:
//!
//! ```text
//! (y - x) * Phi(z) + L * phi(z) - y = 0,    z = (y - x) / L
//! ```
//!
//! where `Phi` and `phi` are the standard normal CDF and PDF. Along the curve
//! `dy/dx = -Phi(z) / (1 - Phi(z))`, so the reserves always move in opposite
//! directions. At the balanced point `x = y = L * phi(0)` the marginal price
//! is exactly 1, and every trade from there is strictly worse than 1:1.
//!
//! The single-parameter functions ([`compute_output_amount`],
//! [`compute_input_amount`]) quote trades starting from that balanced point.

use thiserror::Error;

use crate::math::scale::{Rounding, ScaleError, to_units};

const BISECTION_ITERATIONS: usize = 256;
const MAX_BRACKET_DOUBLINGS: usize = 1024;
const BPS_SCALE: u128 = 10_000;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum CurveError {
    #[error("liquidity must be nonzero")]
    ZeroLiquidity,
    #[error("reserve must be nonzero")]
    ZeroReserve,
    #[error("requested output {requested} exceeds reserve {available}")]
    InsufficientReserve { requested: u128, available: u128 },
    #[error("curve invariant has no solution for the given reserves")]
    NoSolution,
    #[error(transparent)]
    Scale(#[from] ScaleError),
}

/// Complementary error function, fractional error below 1.2e-7 everywhere.
fn erfc(x: f64) -> f64 {
    let z = x.abs();
    let t = 1.0 / (1.0 + 0.5 * z);
    let poly = -z * z - 1.265_512_23
        + t * (1.000_023_68
            + t * (0.374_091_96
                + t * (0.096_784_18
                    + t * (-0.186_288_06
                        + t * (0.278_868_07
                            + t * (-1.135_203_98
                                + t * (1.488_515_87
                                    + t * (-0.822_152_23
                                        + t * 0.170_872_77))))))));
    let ans = t * poly.exp();
    if x >= 0.0 { ans } else { 2.0 - ans }
}

/// Standard normal cumulative distribution function.
pub fn normal_cdf(z: f64) -> f64 {
    0.5 * erfc(-z / std::f64::consts::SQRT_2)
}

/// Standard normal probability density function.
pub fn normal_pdf(z: f64) -> f64 {
    (-0.5 * z * z).exp() / (2.0 * std::f64::consts::PI).sqrt()
}

/// Invariant residual. Strictly decreasing in both `x` and `y`.
fn invariant(x: f64, y: f64, liquidity: f64) -> f64 {
    let z = (y - x) / liquidity;
    (y - x) * normal_cdf(z) + liquidity * normal_pdf(z) - y
}

/// Find the root of a strictly decreasing function on `[0, inf)`.
fn solve_decreasing<F>(f: F, initial_upper: f64) -> Result<f64, CurveError>
where
    F: Fn(f64) -> f64,
{
    let mut lo = 0.0;
    if f(lo) <= 0.0 {
        return Err(CurveError::NoSolution);
    }
    let mut hi = initial_upper.max(1.0);
    let mut doublings = 0;
    while f(hi) > 0.0 {
        lo = hi;
        hi *= 2.0;
        doublings += 1;
        if doublings > MAX_BRACKET_DOUBLINGS || !hi.is_finite() {
            return Err(CurveError::NoSolution);
        }
    }
    for _ in 0..BISECTION_ITERATIONS {
        let mid = lo + (hi - lo) / 2.0;
        if mid <= lo || mid >= hi {
            break;
        }
        if f(mid) > 0.0 {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    Ok(lo + (hi - lo) / 2.0)
}

fn check_liquidity(liquidity: u128) -> Result<f64, CurveError> {
    if liquidity == 0 {
        return Err(CurveError::ZeroLiquidity);
    }
    Ok(liquidity as f64)
}

fn reserve1_from_reserve0_f64(
    x: f64,
    liquidity: f64,
) -> Result<f64, CurveError> {
    solve_decreasing(|y| invariant(x, y, liquidity), x + liquidity)
}

fn reserve0_from_reserve1_f64(
    y: f64,
    liquidity: f64,
) -> Result<f64, CurveError> {
    solve_decreasing(|x| invariant(x, y, liquidity), y + liquidity)
}

/// Reserve of either token at the balanced point, `L * phi(0)`.
pub fn balanced_reserve(liquidity: u128) -> Result<f64, CurveError> {
    let liquidity = check_liquidity(liquidity)?;
    Ok(liquidity * normal_pdf(0.0))
}

/// Token 1 reserve implied by a token 0 reserve.
pub fn compute_reserve1_from_reserve0(
    reserve0: u128,
    liquidity: u128,
) -> Result<u128, CurveError> {
    let liquidity = check_liquidity(liquidity)?;
    if reserve0 == 0 {
        return Err(CurveError::ZeroReserve);
    }
    let y = reserve1_from_reserve0_f64(reserve0 as f64, liquidity)?;
    Ok(to_units(y, Rounding::Nearest)?)
}

/// Token 0 reserve implied by a token 1 reserve.
pub fn compute_reserve0_from_reserve1(
    reserve1: u128,
    liquidity: u128,
) -> Result<u128, CurveError> {
    let liquidity = check_liquidity(liquidity)?;
    if reserve1 == 0 {
        return Err(CurveError::ZeroReserve);
    }
    let x = reserve0_from_reserve1_f64(reserve1 as f64, liquidity)?;
    Ok(to_units(x, Rounding::Nearest)?)
}

/// Amount out of a swap against explicit reserves. Output rounds down.
pub fn compute_swap(
    reserve0: u128,
    reserve1: u128,
    amount_in: u128,
    zero_for_one: bool,
    liquidity: u128,
) -> Result<u128, CurveError> {
    let liquidity = check_liquidity(liquidity)?;
    if reserve0 == 0 || reserve1 == 0 {
        return Err(CurveError::ZeroReserve);
    }
    if amount_in == 0 {
        return Ok(0);
    }
    let (reserve_in, reserve_out) = if zero_for_one {
        (reserve0 as f64, reserve1 as f64)
    } else {
        (reserve1 as f64, reserve0 as f64)
    };
    let new_in = reserve_in + amount_in as f64;
    // The invariant is symmetric under swapping x and y.
    let new_out = reserve1_from_reserve0_f64(new_in, liquidity)?;
    let out = (reserve_out - new_out).max(0.0);
    Ok(to_units(out, Rounding::Down)?)
}

/// Output received for `input` starting from the balanced point.
pub fn compute_output_amount(
    input: u128,
    liquidity: u128,
) -> Result<u128, CurveError> {
    let liquidity = check_liquidity(liquidity)?;
    if input == 0 {
        return Ok(0);
    }
    let balanced = liquidity * normal_pdf(0.0);
    let new_y = reserve1_from_reserve0_f64(balanced + input as f64, liquidity)?;
    let output = to_units((balanced - new_y).max(0.0), Rounding::Down)?;
    // Guard against float noise ever quoting at or above 1:1.
    Ok(output.min(input - 1))
}

/// Input required to receive `output` starting from the balanced point.
/// Inverse of [`compute_output_amount`]. Input rounds up.
pub fn compute_input_amount(
    output: u128,
    liquidity: u128,
) -> Result<u128, CurveError> {
    let liquidity = check_liquidity(liquidity)?;
    if output == 0 {
        return Ok(0);
    }
    let balanced = liquidity * normal_pdf(0.0);
    if output as f64 >= balanced {
        return Err(CurveError::InsufficientReserve {
            requested: output,
            available: to_units(balanced, Rounding::Down)?,
        });
    }
    let new_x =
        reserve0_from_reserve1_f64(balanced - output as f64, liquidity)?;
    Ok(to_units((new_x - balanced).max(0.0), Rounding::Up)?)
}

/// Price impact of a quoted trade, in basis points of the input.
pub fn compute_price_impact(
    input: u128,
    output: u128,
    liquidity: u128,
) -> Result<u32, CurveError> {
    check_liquidity(liquidity)?;
    if input == 0 || output >= input {
        return Ok(0);
    }
    let shortfall = input - output;
    // shortfall < input, so the quotient is below BPS_SCALE
    let bps = shortfall
        .checked_mul(BPS_SCALE)
        .map(|scaled| scaled / input)
        .unwrap_or_else(|| shortfall / (input / BPS_SCALE).max(1));
    Ok(bps.min(BPS_SCALE) as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    const UNIT: u128 = 1_000_000_000_000_000_000;

    #[test]
    fn test_normal_functions() {
        assert!((normal_cdf(0.0) - 0.5).abs() < 1e-7);
        assert!((normal_cdf(1.0) - 0.841_344_746).abs() < 1e-6);
        assert!((normal_cdf(-1.0) - 0.158_655_254).abs() < 1e-6);
        assert!((normal_pdf(0.0) - 0.398_942_280).abs() < 1e-9);
    }

    #[test]
    fn test_balanced_point_is_on_curve() {
        let liquidity = 1000 * UNIT;
        let balanced = balanced_reserve(liquidity).unwrap();
        let residual = invariant(balanced, balanced, liquidity as f64);
        assert!(residual.abs() / balanced < 1e-6);
    }

    #[test]
    fn test_output_less_than_input() {
        for input in [1u128, 10, 100, 500] {
            let output =
                compute_output_amount(input * UNIT, 1000 * UNIT).unwrap();
            assert!(output < input * UNIT, "input {input}");
            assert!(output > 0);
        }
        let small = compute_output_amount(100, 1000).unwrap();
        assert!(small < 100);
    }

    #[test]
    fn test_round_trip_within_one_percent() {
        let output = compute_output_amount(100, 1000).unwrap();
        let input = compute_input_amount(output, 1000).unwrap();
        assert!(input.abs_diff(100) <= 1, "round trip gave {input}");

        let output = compute_output_amount(100 * UNIT, 1000 * UNIT).unwrap();
        let input = compute_input_amount(output, 1000 * UNIT).unwrap();
        assert!(input.abs_diff(100 * UNIT) * 100 <= 100 * UNIT);
    }

    #[test]
    fn test_zero_input_and_zero_liquidity() {
        assert_eq!(compute_output_amount(0, 1000).unwrap(), 0);
        assert_eq!(compute_input_amount(0, 1000).unwrap(), 0);
        assert_eq!(
            compute_output_amount(100, 0),
            Err(CurveError::ZeroLiquidity)
        );
        assert_eq!(compute_input_amount(10, 0), Err(CurveError::ZeroLiquidity));
    }

    #[test]
    fn test_input_amount_rejects_draining_output() {
        assert!(matches!(
            compute_input_amount(1000, 1000),
            Err(CurveError::InsufficientReserve { .. })
        ));
    }

    #[test]
    fn test_price_impact_bounded() {
        let output = compute_output_amount(100 * UNIT, 1000 * UNIT).unwrap();
        let impact =
            compute_price_impact(100 * UNIT, output, 1000 * UNIT).unwrap();
        assert!(impact > 0);
        assert!(impact < 5_000);
        assert_eq!(compute_price_impact(0, 0, 1000).unwrap(), 0);
        assert_eq!(
            compute_price_impact(10, 5, 0),
            Err(CurveError::ZeroLiquidity)
        );
    }

    #[test]
    fn test_price_impact_grows_with_size() {
        let liquidity = 1000 * UNIT;
        let small_out = compute_output_amount(10 * UNIT, liquidity).unwrap();
        let large_out = compute_output_amount(200 * UNIT, liquidity).unwrap();
        let small =
            compute_price_impact(10 * UNIT, small_out, liquidity).unwrap();
        let large =
            compute_price_impact(200 * UNIT, large_out, liquidity).unwrap();
        assert!(small < large);
    }

    #[test]
    fn test_reserves_move_in_opposite_directions() {
        let liquidity = 1000 * UNIT;
        let y_small =
            compute_reserve1_from_reserve0(300 * UNIT, liquidity).unwrap();
        let y_large =
            compute_reserve1_from_reserve0(500 * UNIT, liquidity).unwrap();
        assert!(y_large < y_small);

        let x_small =
            compute_reserve0_from_reserve1(300 * UNIT, liquidity).unwrap();
        let x_large =
            compute_reserve0_from_reserve1(500 * UNIT, liquidity).unwrap();
        assert!(x_large < x_small);
    }

    #[test]
    fn test_reserve_functions_are_inverse() {
        let liquidity = 1000 * UNIT;
        let x = 450 * UNIT;
        let y = compute_reserve1_from_reserve0(x, liquidity).unwrap();
        let back = compute_reserve0_from_reserve1(y, liquidity).unwrap();
        assert!(back.abs_diff(x) * 1_000_000 <= x);
    }

    #[test]
    fn test_reserve_functions_reject_zero_liquidity() {
        assert_eq!(
            compute_reserve1_from_reserve0(100, 0),
            Err(CurveError::ZeroLiquidity)
        );
        assert_eq!(
            compute_reserve0_from_reserve1(100, 0),
            Err(CurveError::ZeroLiquidity)
        );
        assert_eq!(
            compute_swap(100, 100, 10, true, 0),
            Err(CurveError::ZeroLiquidity)
        );
    }

    #[test]
    fn test_swap_direction_symmetry() {
        let liquidity = 1000 * UNIT;
        let balanced = balanced_reserve(liquidity).unwrap() as u128;
        let out_one =
            compute_swap(balanced, balanced, 50 * UNIT, true, liquidity)
                .unwrap();
        let out_zero =
            compute_swap(balanced, balanced, 50 * UNIT, false, liquidity)
                .unwrap();
        assert!(out_one.abs_diff(out_zero) * 1_000_000 <= out_one);
        assert!(out_one < 50 * UNIT);
        assert_eq!(
            compute_swap(balanced, balanced, 0, true, liquidity).unwrap(),
            0
        );
    }
}
