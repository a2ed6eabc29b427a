use std::collections::BTreeSet;
use std::fmt;
use std::ops::{Add, AddAssign, Mul, MulAssign, Sub};

/// An affine form whose atoms may themselves be floor-divisions or remainders of affine forms.
pub type NonAffineExpr<T> = AffineForm<NonAffine<T>>;

pub trait Bounds {
    /// The inclusive bounds of the value, if known.
    fn bounds(&self) -> Option<(i32, i32)> {
        None
    }

    fn as_constant(&self) -> Option<i32> {
        if let Some((lower_bound, upper_bound)) = self.bounds() {
            if lower_bound == upper_bound {
                return Some(lower_bound);
            }
        }
        None
    }
}

pub trait Atom: Clone + Eq + Ord + Bounds {}

/// A sum of [`Term`]s plus a constant intercept.
#[derive(Debug, PartialEq, Eq, Clone, PartialOrd, Ord)]
pub struct AffineForm<T>(pub Vec<Term<T>>, pub i32);

#[derive(Debug, PartialEq, Eq, Clone, PartialOrd, Ord)]
pub struct Term<T>(pub i32, pub T);

#[derive(Debug, PartialEq, Eq, Clone, PartialOrd, Ord)]
pub enum NonAffine<T> {
    Leaf(T),
    FloorDiv(Box<NonAffineExpr<T>>, i32),
    Mod(Box<NonAffineExpr<T>>, i32),
}

impl<T> AffineForm<T> {
    pub const fn zero() -> Self {
        AffineForm(vec![], 0)
    }

    pub const fn constant(c: i32) -> Self {
        AffineForm(vec![], c)
    }

    pub fn terms(&self) -> &[Term<T>] {
        &self.0
    }

    pub fn intercept(&self) -> i32 {
        self.1
    }
}

impl<T: Bounds> Bounds for AffineForm<T> {
    fn bounds(&self) -> Option<(i32, i32)> {
        let mut minimum = self.1;
        let mut maximum = self.1;
        for Term(coeff, sym) in &self.0 {
            let (sym_min, sym_max) = sym.bounds()?;
            if *coeff < 0 {
                minimum = minimum.checked_add(coeff.checked_mul(sym_max)?)?;
                maximum = maximum.checked_add(coeff.checked_mul(sym_min)?)?;
            } else {
                minimum = minimum.checked_add(coeff.checked_mul(sym_min)?)?;
                maximum = maximum.checked_add(coeff.checked_mul(sym_max)?)?;
            }
        }
        Some((minimum, maximum))
    }
}

impl<T: Bounds> Bounds for NonAffine<T> {
    fn bounds(&self) -> Option<(i32, i32)> {
        match self {
            NonAffine::Leaf(v) => v.bounds(),
            NonAffine::FloorDiv(v, d) => v
                .bounds()
                .map(|(v_min, v_max)| (v_min.div_euclid(*d), v_max.div_euclid(*d))),
            NonAffine::Mod(v, m) => match v.bounds() {
                Some((v_min, v_max)) if v_min >= 0 => Some((0, v_max.min(m - 1))),
                _ => Some((0, m - 1)),
            },
        }
    }
}

impl<T: Atom> NonAffineExpr<T> {
    pub fn var(t: T) -> Self {
        AffineForm(vec![Term(1, NonAffine::Leaf(t))], 0)
    }

    /// Floor-divides by a positive constant, folding the division away where bounds allow.
    pub fn floor_div(self, d: i32) -> Self {
        assert!(d > 0, "divisor must be positive, got {d}");
        if d == 1 {
            return self;
        }
        if let Some(c) = self.as_constant() {
            return Self::constant(c.div_euclid(d));
        }
        match self.bounds() {
            Some((lo, hi)) if lo >= 0 && hi < d => return Self::zero(),
            _ => {}
        }
        let (divisible, rest) = self.split_by_divisor(d);
        if let Some((lo, hi)) = rest.bounds() {
            if lo >= 0 && hi < d {
                return divisible.exact_div(d);
            }
        }
        AffineForm(vec![Term(1, NonAffine::FloorDiv(Box::new(self), d))], 0)
    }

    /// Euclidean remainder by a positive constant.
    pub fn modulo(self, m: i32) -> Self {
        assert!(m > 0, "modulus must be positive, got {m}");
        if m == 1 {
            return Self::zero();
        }
        if let Some(c) = self.as_constant() {
            return Self::constant(c.rem_euclid(m));
        }
        match self.bounds() {
            Some((lo, hi)) if lo >= 0 && hi < m => return self,
            _ => {}
        }
        let (_, rest) = self.split_by_divisor(m);
        if let Some((lo, hi)) = rest.bounds() {
            if lo >= 0 && hi < m {
                return rest;
            }
        }
        AffineForm(vec![Term(1, NonAffine::Mod(Box::new(self), m))], 0)
    }

    /// Partitions into the part whose coefficients (and intercept) are multiples of `d` and
    /// the remainder.
    fn split_by_divisor(&self, d: i32) -> (Self, Self) {
        let mut divisible = AffineForm(vec![], self.1 - self.1.rem_euclid(d));
        let mut rest = AffineForm(vec![], self.1.rem_euclid(d));
        for term in &self.0 {
            if term.0 % d == 0 {
                divisible.0.push(term.clone());
            } else {
                rest.0.push(term.clone());
            }
        }
        (divisible, rest)
    }

    fn exact_div(self, d: i32) -> Self {
        debug_assert_eq!(self.1 % d, 0);
        AffineForm(
            self.0.into_iter().map(|Term(c, s)| Term(c / d, s)).collect(),
            self.1 / d,
        )
    }

    /// Replaces every variable with an expression.
    pub fn map_vars<U: Atom>(&self, mapper: &mut impl FnMut(&T) -> NonAffineExpr<U>) -> NonAffineExpr<U> {
        let mut accum = NonAffineExpr::constant(self.1);
        for Term(c, s) in &self.0 {
            let subbed = match s {
                NonAffine::Leaf(v) => mapper(v),
                NonAffine::FloorDiv(inner, d) => inner.map_vars(mapper).floor_div(*d),
                NonAffine::Mod(inner, m) => inner.map_vars(mapper).modulo(*m),
            };
            if subbed.as_constant() != Some(0) {
                accum += subbed * *c;
            }
        }
        accum
    }

    /// Substitutes `replacement` for every occurrence of `atom`.
    pub fn subs(&self, atom: &T, replacement: &NonAffineExpr<T>) -> Self {
        self.map_vars(&mut |v| {
            if v == atom {
                replacement.clone()
            } else {
                Self::var(v.clone())
            }
        })
    }

    pub fn eval(&self, env: &impl Fn(&T) -> i32) -> i32 {
        let mut total = self.1;
        for Term(c, s) in &self.0 {
            let v = match s {
                NonAffine::Leaf(t) => env(t),
                NonAffine::FloorDiv(inner, d) => inner.eval(env).div_euclid(*d),
                NonAffine::Mod(inner, m) => inner.eval(env).rem_euclid(*m),
            };
            total += c * v;
        }
        total
    }

    pub fn vars(&self) -> BTreeSet<T> {
        let mut result = BTreeSet::new();
        self.collect_vars(&mut result);
        result
    }

    fn collect_vars(&self, out: &mut BTreeSet<T>) {
        for Term(_, s) in &self.0 {
            match s {
                NonAffine::Leaf(t) => {
                    out.insert(t.clone());
                }
                NonAffine::FloorDiv(inner, _) | NonAffine::Mod(inner, _) => {
                    inner.collect_vars(out)
                }
            }
        }
    }

    pub fn contains_var(&self, atom: &T) -> bool {
        self.0.iter().any(|Term(_, s)| match s {
            NonAffine::Leaf(t) => t == atom,
            NonAffine::FloorDiv(inner, _) | NonAffine::Mod(inner, _) => inner.contains_var(atom),
        })
    }

    /// Returns the coefficient of `atom` if it only occurs as a top-level leaf term.
    ///
    /// Returns `None` if `atom` occurs under a division or remainder, and `Some(0)` if it does
    /// not occur at all.
    pub fn linear_coefficient(&self, atom: &T) -> Option<i32> {
        let mut coeff = 0;
        for Term(c, s) in &self.0 {
            match s {
                NonAffine::Leaf(t) if t == atom => coeff += c,
                NonAffine::Leaf(_) => {}
                NonAffine::FloorDiv(inner, _) | NonAffine::Mod(inner, _) => {
                    if inner.contains_var(atom) {
                        return None;
                    }
                }
            }
        }
        Some(coeff)
    }

    /// Merges like terms and rewrites `(e / d) * d + e % d` back into `e`.
    fn normalize(&mut self) {
        self.0.sort_by(|a, b| a.1.cmp(&b.1));
        let mut merged: Vec<Term<NonAffine<T>>> = Vec::with_capacity(self.0.len());
        for term in self.0.drain(..) {
            match merged.last_mut() {
                Some(last) if last.1 == term.1 => last.0 += term.0,
                _ => merged.push(term),
            }
        }
        merged.retain(|t| t.0 != 0);
        self.0 = merged;

        'outer: loop {
            for i in 0..self.0.len() {
                let NonAffine::FloorDiv(num, d) = &self.0[i].1 else {
                    continue;
                };
                for j in 0..self.0.len() {
                    let NonAffine::Mod(num2, m) = &self.0[j].1 else {
                        continue;
                    };
                    let c_mod = self.0[j].0;
                    if num == num2 && d == m && self.0[i].0 == c_mod * d {
                        let replacement = (**num).clone() * c_mod;
                        let (hi, lo) = if i > j { (i, j) } else { (j, i) };
                        self.0.remove(hi);
                        self.0.remove(lo);
                        *self += replacement;
                        continue 'outer;
                    }
                }
            }
            break;
        }
    }
}

impl<T: Atom> From<T> for NonAffineExpr<T> {
    fn from(t: T) -> Self {
        NonAffineExpr::var(t)
    }
}

impl<T: Atom> AddAssign for NonAffineExpr<T> {
    fn add_assign(&mut self, rhs: Self) {
        self.0.extend(rhs.0);
        self.1 += rhs.1;
        self.normalize();
    }
}

impl<T: Atom> Add for NonAffineExpr<T> {
    type Output = Self;

    fn add(mut self, rhs: Self) -> Self::Output {
        self += rhs;
        self
    }
}

impl<T: Atom> Add<i32> for NonAffineExpr<T> {
    type Output = Self;

    fn add(mut self, rhs: i32) -> Self::Output {
        self.1 += rhs;
        self
    }
}

impl<T: Atom> Sub<i32> for NonAffineExpr<T> {
    type Output = Self;

    fn sub(mut self, rhs: i32) -> Self::Output {
        self.1 -= rhs;
        self
    }
}

impl<T: Atom> MulAssign<i32> for NonAffineExpr<T> {
    fn mul_assign(&mut self, rhs: i32) {
        if rhs == 0 {
            self.0.clear();
            self.1 = 0;
            return;
        }
        for term in &mut self.0 {
            term.0 *= rhs;
        }
        self.1 *= rhs;
    }
}

impl<T: Atom> Mul<i32> for NonAffineExpr<T> {
    type Output = Self;

    fn mul(mut self, rhs: i32) -> Self::Output {
        self *= rhs;
        self
    }
}

impl<T> NonAffineExpr<T> {
    /// Formats the expression, delegating the rendering of atoms to `leaf`.
    pub fn fmt_with(
        &self,
        f: &mut fmt::Formatter<'_>,
        leaf: &dyn Fn(&T, &mut fmt::Formatter<'_>) -> fmt::Result,
    ) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "{}", self.1);
        }
        for (i, Term(c, s)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, " {} ", if *c < 0 { '-' } else { '+' })?;
            } else if *c < 0 {
                write!(f, "-")?;
            }
            match s {
                NonAffine::Leaf(t) => leaf(t, f)?,
                NonAffine::FloorDiv(inner, d) => {
                    write!(f, "(")?;
                    inner.fmt_with(f, leaf)?;
                    write!(f, " / {d})")?;
                }
                NonAffine::Mod(inner, m) => {
                    write!(f, "(")?;
                    inner.fmt_with(f, leaf)?;
                    write!(f, " % {m})")?;
                }
            }
            if c.abs() != 1 {
                write!(f, "*{}", c.abs())?;
            }
        }
        match self.1.cmp(&0) {
            std::cmp::Ordering::Greater => write!(f, " + {}", self.1),
            std::cmp::Ordering::Less => write!(f, " - {}", -self.1),
            std::cmp::Ordering::Equal => Ok(()),
        }
    }
}

impl<T: fmt::Display> fmt::Display for NonAffineExpr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_with(f, &|t, f| write!(f, "{t}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
    struct TestAtom(&'static str, i32);

    impl Bounds for TestAtom {
        fn bounds(&self) -> Option<(i32, i32)> {
            Some((0, self.1 - 1))
        }
    }
    impl Atom for TestAtom {}

    impl fmt::Display for TestAtom {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.0)
        }
    }

    fn v(name: &'static str, extent: i32) -> NonAffineExpr<TestAtom> {
        NonAffineExpr::var(TestAtom(name, extent))
    }

    #[test]
    fn test_affineform_bounds_mixed_signs() {
        let e = v("a", 11) + v("b", 6) * -2 + 1;
        assert_eq!(e.bounds(), Some((-9, 11)));
    }

    #[test]
    fn test_floor_div_folds_when_in_range() {
        assert_eq!(v("a", 4).floor_div(4), NonAffineExpr::zero());
        assert_eq!(v("a", 4).modulo(4), v("a", 4));
    }

    #[test]
    fn test_floor_div_of_split_recovers_outer() {
        let e = v("o", 3) * 4 + v("i", 4);
        assert_eq!(e.clone().floor_div(4), v("o", 3));
        assert_eq!(e.modulo(4), v("i", 4));
    }

    #[test]
    fn test_div_mod_pair_normalizes_to_numerator() {
        let f = v("f", 12);
        let e = f.clone().floor_div(4) * 4 + f.clone().modulo(4);
        assert_eq!(e, f);
    }

    #[test]
    fn test_subs_replaces_leaf() {
        let e = v("a", 8) * 2 + v("b", 3);
        let replaced = e.subs(&TestAtom("a", 8), &(v("x", 2) * 4 + v("y", 4)));
        assert_eq!(replaced, v("b", 3) + v("x", 2) * 8 + v("y", 4) * 2);
    }

    #[test]
    fn test_linear_coefficient_rejects_nested_occurrences() {
        let e = v("a", 16).floor_div(4) + v("b", 2) * 3;
        assert_eq!(e.linear_coefficient(&TestAtom("b", 2)), Some(3));
        assert_eq!(e.linear_coefficient(&TestAtom("a", 16)), None);
        assert_eq!(e.linear_coefficient(&TestAtom("c", 2)), Some(0));
    }

    #[test]
    fn test_display() {
        let e = v("a", 16).floor_div(3) * 2 + v("b", 2) - 1;
        assert_eq!(e.to_string(), "b + (a / 3)*2 - 1");
    }

    proptest! {
        #[test]
        fn test_div_mod_simplification_preserves_value(
            outer in 1i32..6, inner in 1i32..6, d in 1i32..8, o in 0i32..6, i in 0i32..6
        ) {
            prop_assume!(o < outer && i < inner);
            let e = v("o", outer) * inner + v("i", inner);
            let env = |t: &TestAtom| if t.0 == "o" { o } else { i };
            let expected = o * inner + i;
            prop_assert_eq!(e.clone().floor_div(d).eval(&env), expected.div_euclid(d));
            prop_assert_eq!(e.modulo(d).eval(&env), expected.rem_euclid(d));
        }
    }
}
