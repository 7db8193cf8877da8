use num_rational::Ratio;
use serde::{Deserialize, Serialize};
use strum::{EnumCount, EnumIter, IntoEnumIterator};

use std::fmt::{self, Display};
use std::ops::{Div, DivAssign, Mul, MulAssign};

pub const STATIC_VAR_COUNT: usize = StaticVar::COUNT;
pub const MAX_DYNAMIC_VARS: usize = 8;

/// A dimension whose value is known once a layer of the reference network is chosen.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Deserialize,
    Serialize,
    EnumCount,
    EnumIter,
)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum StaticVar {
    /// Global group count.
    G,
    /// Reduction ratio.
    R,
    C,
    H,
    W,
}

/// A symbolic monomial: a positive rational coefficient times integer powers of static and
/// dynamic variables.
///
/// The coefficient is kept reduced, so structurally equal expressions compare (and hash) equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct Variable {
    numeric: Ratio<u64>,
    static_power: [i8; STATIC_VAR_COUNT],
    dynamic_power: [i8; MAX_DYNAMIC_VARS],
}

/// Concrete values of every [StaticVar] for one layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct StaticSpecs {
    pub g: u64,
    pub r: u64,
    pub c: u64,
    pub h: u64,
    pub w: u64,
}

/// A (possibly partial) assignment of positive integers to dynamic variables.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct DynamicFills([Option<u64>; MAX_DYNAMIC_VARS]);

/// Commits dynamic variable `index` to `substitution`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct VarSolution {
    pub index: usize,
    pub substitution: Variable,
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillError {
    #[error("Dynamic variable x{0} has no fill")]
    Unfilled(usize),
    #[error("Expression does not evaluate to an integer")]
    NotIntegral,
    #[error("Expression overflows a 64-bit integer")]
    Overflow,
}

impl Variable {
    pub fn number(n: u64) -> Self {
        debug_assert_ne!(n, 0);
        Variable {
            numeric: Ratio::from_integer(n),
            static_power: [0; STATIC_VAR_COUNT],
            dynamic_power: [0; MAX_DYNAMIC_VARS],
        }
    }

    pub fn one() -> Self {
        Self::number(1)
    }

    pub fn static_var(var: StaticVar) -> Self {
        let mut v = Self::one();
        v.static_power[var as usize] = 1;
        v
    }

    pub fn dynamic(index: usize) -> Self {
        assert!(
            index < MAX_DYNAMIC_VARS,
            "dynamic variable index out of range"
        );
        let mut v = Self::one();
        v.dynamic_power[index] = 1;
        v
    }

    pub fn is_one(&self) -> bool {
        *self == Self::one()
    }

    /// Returns `true` if no dynamic variable occurs in the expression.
    pub fn is_static(&self) -> bool {
        self.dynamic_power.iter().all(|&p| p == 0)
    }

    pub fn static_power(&self, var: StaticVar) -> i8 {
        self.static_power[var as usize]
    }

    pub fn dynamic_power(&self, index: usize) -> i8 {
        self.dynamic_power[index]
    }

    /// The indices of dynamic variables occurring in the expression, ascending.
    pub fn dynamic_vars(&self) -> impl Iterator<Item = usize> + '_ {
        self.dynamic_power
            .iter()
            .enumerate()
            .filter_map(|(i, &p)| (p != 0).then_some(i))
    }

    /// The value of the expression if it has no variables and is integral.
    pub fn as_constant(&self) -> Option<u64> {
        if self.static_power.iter().any(|&p| p != 0) || !self.is_static() {
            return None;
        }
        self.numeric.is_integer().then(|| self.numeric.to_integer())
    }

    pub fn powi(&self, exp: i8) -> Self {
        let mut result = Self::one();
        for _ in 0..exp.unsigned_abs() {
            if exp > 0 {
                result *= *self;
            } else {
                result /= *self;
            }
        }
        result
    }

    /// Returns the expression with dynamic variable `solution.index` replaced.
    pub fn subs(&self, solution: &VarSolution) -> Self {
        let power = self.dynamic_power[solution.index];
        if power == 0 {
            return *self;
        }
        let mut base = *self;
        base.dynamic_power[solution.index] = 0;
        base * solution.substitution.powi(power)
    }

    /// Evaluates to a positive integer under a layer's static specs and dynamic fills.
    pub fn fill_to_integer(
        &self,
        specs: &StaticSpecs,
        fills: &DynamicFills,
    ) -> Result<u64, FillError> {
        let mut numer = u128::from(*self.numeric.numer());
        let mut denom = u128::from(*self.numeric.denom());
        let static_values = StaticVar::iter().map(|v| (self.static_power(v), specs.get(v)));
        let mut dynamic_values = Vec::with_capacity(MAX_DYNAMIC_VARS);
        for index in self.dynamic_vars() {
            let value = fills.get(index).ok_or(FillError::Unfilled(index))?;
            dynamic_values.push((self.dynamic_power[index], value));
        }
        for (power, value) in static_values.chain(dynamic_values) {
            let factor = u128::from(value)
                .checked_pow(u32::from(power.unsigned_abs()))
                .ok_or(FillError::Overflow)?;
            let target = if power > 0 { &mut numer } else { &mut denom };
            *target = target.checked_mul(factor).ok_or(FillError::Overflow)?;
        }
        if numer % denom != 0 {
            return Err(FillError::NotIntegral);
        }
        u64::try_from(numer / denom).map_err(|_| FillError::Overflow)
    }

    /// Like [Variable::fill_to_integer], but returns `None` instead of an error when some dynamic
    /// variable is still unfilled.
    pub fn check_filled(&self, specs: &StaticSpecs, fills: &DynamicFills) -> Option<bool> {
        match self.fill_to_integer(specs, fills) {
            Ok(v) => Some(v > 0),
            Err(FillError::Unfilled(_)) => None,
            Err(_) => Some(false),
        }
    }
}

impl Default for Variable {
    fn default() -> Self {
        Self::one()
    }
}

impl From<StaticVar> for Variable {
    fn from(var: StaticVar) -> Self {
        Variable::static_var(var)
    }
}

impl MulAssign for Variable {
    fn mul_assign(&mut self, rhs: Self) {
        self.numeric *= rhs.numeric;
        for (l, r) in self.static_power.iter_mut().zip(rhs.static_power) {
            *l += r;
        }
        for (l, r) in self.dynamic_power.iter_mut().zip(rhs.dynamic_power) {
            *l += r;
        }
    }
}

impl DivAssign for Variable {
    fn div_assign(&mut self, rhs: Self) {
        self.numeric /= rhs.numeric;
        for (l, r) in self.static_power.iter_mut().zip(rhs.static_power) {
            *l -= r;
        }
        for (l, r) in self.dynamic_power.iter_mut().zip(rhs.dynamic_power) {
            *l -= r;
        }
    }
}

impl Mul for Variable {
    type Output = Self;

    fn mul(mut self, rhs: Self) -> Self::Output {
        self *= rhs;
        self
    }
}

impl Div for Variable {
    type Output = Self;

    fn div(mut self, rhs: Self) -> Self::Output {
        self /= rhs;
        self
    }
}

impl Mul<u64> for Variable {
    type Output = Self;

    fn mul(self, rhs: u64) -> Self::Output {
        self * Variable::number(rhs)
    }
}

impl Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut numer_factors = Vec::new();
        let mut denom_factors = Vec::new();
        if *self.numeric.numer() != 1 {
            numer_factors.push(self.numeric.numer().to_string());
        }
        if *self.numeric.denom() != 1 {
            denom_factors.push(self.numeric.denom().to_string());
        }
        let dynamic_names = (0..MAX_DYNAMIC_VARS).map(|i| format!("x{i}"));
        let names = StaticVar::iter()
            .map(|v| format!("{v:?}"))
            .chain(dynamic_names)
            .zip(self.static_power.into_iter().chain(self.dynamic_power));
        for (name, power) in names {
            let factor = match power.unsigned_abs() {
                0 => continue,
                1 => name,
                p => format!("{name}^{p}"),
            };
            if power > 0 {
                numer_factors.push(factor);
            } else {
                denom_factors.push(factor);
            }
        }
        if numer_factors.is_empty() {
            write!(f, "1")?;
        } else {
            write!(f, "{}", numer_factors.join("*"))?;
        }
        for factor in denom_factors {
            write!(f, "/{factor}")?;
        }
        Ok(())
    }
}

impl StaticSpecs {
    pub fn get(&self, var: StaticVar) -> u64 {
        match var {
            StaticVar::G => self.g,
            StaticVar::R => self.r,
            StaticVar::C => self.c,
            StaticVar::H => self.h,
            StaticVar::W => self.w,
        }
    }
}

impl Display for StaticSpecs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "G={}, R={}, C={}, H={}, W={}",
            self.g, self.r, self.c, self.h, self.w
        )
    }
}

impl DynamicFills {
    pub fn get(&self, index: usize) -> Option<u64> {
        self.0[index]
    }

    pub fn set(&mut self, index: usize, value: u64) {
        debug_assert_ne!(value, 0);
        self.0[index] = Some(value);
    }

    pub fn clear(&mut self, index: usize) {
        self.0[index] = None;
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(Option::is_none)
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, u64)> + '_ {
        self.0
            .iter()
            .enumerate()
            .filter_map(|(i, v)| v.map(|v| (i, v)))
    }
}

impl FromIterator<(usize, u64)> for DynamicFills {
    fn from_iter<I: IntoIterator<Item = (usize, u64)>>(iter: I) -> Self {
        let mut fills = DynamicFills::default();
        for (i, v) in iter {
            fills.set(i, v);
        }
        fills
    }
}

impl Display for DynamicFills {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "{{}}");
        }
        let entries = self
            .iter()
            .map(|(i, v)| format!("x{i}={v}"))
            .collect::<Vec<_>>();
        write!(f, "{{{}}}", entries.join(", "))
    }
}

impl VarSolution {
    pub fn new(index: usize, substitution: Variable) -> Self {
        debug_assert_eq!(substitution.dynamic_power(index), 0);
        VarSolution {
            index,
            substitution,
        }
    }
}

impl Display for VarSolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "x{} := {}", self.index, self.substitution)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn specs() -> StaticSpecs {
        StaticSpecs {
            g: 4,
            r: 2,
            c: 64,
            h: 16,
            w: 8,
        }
    }

    #[test]
    fn test_fill_static_product() {
        let v = Variable::from(StaticVar::C) * Variable::from(StaticVar::H) * 2;
        assert_eq!(
            v.fill_to_integer(&specs(), &DynamicFills::default()),
            Ok(64 * 16 * 2)
        );
    }

    #[test]
    fn test_fill_quotient() {
        let v = Variable::from(StaticVar::C) / Variable::from(StaticVar::G);
        assert_eq!(
            v.fill_to_integer(&specs(), &DynamicFills::default()),
            Ok(16)
        );
        let odd = Variable::from(StaticVar::G) / Variable::number(3);
        assert_eq!(
            odd.fill_to_integer(&specs(), &DynamicFills::default()),
            Err(FillError::NotIntegral)
        );
    }

    #[test]
    fn test_fill_requires_dynamic_values() {
        let v = Variable::from(StaticVar::C) / Variable::dynamic(2);
        assert_eq!(
            v.fill_to_integer(&specs(), &DynamicFills::default()),
            Err(FillError::Unfilled(2))
        );
        let fills = [(2, 8)].into_iter().collect::<DynamicFills>();
        assert_eq!(v.fill_to_integer(&specs(), &fills), Ok(8));
        assert_eq!(v.check_filled(&specs(), &DynamicFills::default()), None);
    }

    #[test]
    fn test_subs_replaces_every_power() {
        let x = Variable::dynamic(0);
        let v = x * x / Variable::from(StaticVar::G);
        let solved = v.subs(&VarSolution::new(0, Variable::from(StaticVar::C)));
        assert!(solved.is_static());
        assert_eq!(solved.static_power(StaticVar::C), 2);
        assert_eq!(solved.static_power(StaticVar::G), -1);
    }

    #[test]
    fn test_quotient_cancels_to_one() {
        let c = Variable::from(StaticVar::C);
        assert!((c / c).is_one());
        assert_eq!((c / c).as_constant(), Some(1));
        assert_eq!(c.as_constant(), None);
    }

    #[test]
    fn test_display() {
        let v = Variable::from(StaticVar::C) * Variable::dynamic(1) / Variable::from(StaticVar::G);
        assert_eq!(v.to_string(), "C*x1/G");
        assert_eq!(Variable::one().to_string(), "1");
        let h = Variable::from(StaticVar::H);
        assert_eq!((h * h).to_string(), "H^2");
    }

    proptest! {
        #[test]
        fn test_mul_then_div_is_identity(
            a in proptest::collection::vec(any::<StaticVar>(), 0..4),
            b in proptest::collection::vec(any::<StaticVar>(), 0..4),
        ) {
            let lhs = a
                .into_iter()
                .fold(Variable::one(), |acc, v| acc * Variable::from(v));
            let rhs = b
                .into_iter()
                .fold(Variable::number(3), |acc, v| acc * Variable::from(v));
            prop_assert_eq!((lhs * rhs) / rhs, lhs);
        }
    }
}
