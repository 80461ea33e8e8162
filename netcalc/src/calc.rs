//! Default arithmetic provider.
//!
//! The connection handler only sees [`ArithmeticFn`]; [`evaluate`] is the
//! implementation the server installs unless a caller supplies another one.

use thiserror::Error;

use crate::datagram::{ErrorCode, Operation};

/// Domain faults raised by an arithmetic provider.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithmeticError {
    #[error("operands outside the operation's domain")]
    InvalidArgument,
    #[error("result exceeds the representable range")]
    MaxValueExceeded,
}

impl ArithmeticError {
    pub fn code(self) -> ErrorCode {
        match self {
            ArithmeticError::InvalidArgument => ErrorCode::InvalidArgument,
            ArithmeticError::MaxValueExceeded => ErrorCode::MaxValueExceeded,
        }
    }
}

/// Pluggable arithmetic provider.
pub type ArithmeticFn =
    dyn Fn(Operation, f64, f64) -> Result<f64, ArithmeticError> + Send + Sync;

/// Compute `operation` over `(a, b)`.
///
/// - `power`: `a` raised to `b`.
/// - `log`: logarithm of `b` to base `a`.
/// - `GM`: geometric mean of `a` and `b`.
/// - `aCb`: binomial coefficient "a choose b".
pub fn evaluate(operation: Operation, a: f64, b: f64) -> Result<f64, ArithmeticError> {
    if a.is_nan() || b.is_nan() {
        return Err(ArithmeticError::InvalidArgument);
    }
    let value = match operation {
        Operation::Power => power(a, b)?,
        Operation::Log => logarithm(a, b)?,
        Operation::GeoMean => geometric_mean(a, b)?,
        Operation::BinCoe => binomial(a, b)?,
    };
    check(value)
}

fn power(a: f64, b: f64) -> Result<f64, ArithmeticError> {
    if a == 0.0 && b < 0.0 {
        return Err(ArithmeticError::InvalidArgument);
    }
    Ok(a.powf(b))
}

fn logarithm(base: f64, x: f64) -> Result<f64, ArithmeticError> {
    if base <= 0.0 || base == 1.0 || x <= 0.0 || !base.is_finite() || !x.is_finite() {
        return Err(ArithmeticError::InvalidArgument);
    }
    Ok(x.ln() / base.ln())
}

fn geometric_mean(a: f64, b: f64) -> Result<f64, ArithmeticError> {
    let product = a * b;
    if product.is_nan() || product < 0.0 {
        return Err(ArithmeticError::InvalidArgument);
    }
    if product.is_infinite() {
        // a*b overflowed even though the mean itself may fit.
        let mean = a.abs().sqrt() * b.abs().sqrt();
        return check(mean);
    }
    Ok(product.sqrt())
}

fn binomial(n: f64, k: f64) -> Result<f64, ArithmeticError> {
    let integral = |x: f64| x.is_finite() && x >= 0.0 && x.fract() == 0.0;
    if !integral(n) || !integral(k) || k > n {
        return Err(ArithmeticError::InvalidArgument);
    }
    let k = k.min(n - k);
    let mut value = 1.0_f64;
    let mut i = 1.0_f64;
    while i <= k {
        value = value * (n - k + i) / i;
        if !value.is_finite() {
            return Err(ArithmeticError::MaxValueExceeded);
        }
        i += 1.0;
    }
    Ok(value.round())
}

fn check(value: f64) -> Result<f64, ArithmeticError> {
    if value.is_nan() {
        Err(ArithmeticError::InvalidArgument)
    } else if value.is_infinite() {
        Err(ArithmeticError::MaxValueExceeded)
    } else {
        Ok(value)
    }
}
