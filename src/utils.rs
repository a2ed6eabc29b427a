const INDENT_SIZE: usize = 2;

pub fn indent(depth: usize) -> String {
    " ".repeat(depth * INDENT_SIZE)
}

/// Returns the factors of an integer, in ascending order.
pub fn factors(x: u32) -> Vec<u32> {
    let mut result = Vec::new();
    let mut i = 1;
    while i * i <= x {
        if x % i == 0 {
            result.push(i);
            if x / i != i {
                result.push(x / i);
            }
        }
        i += 1;
    }
    result.sort_unstable();
    result
}

/// The largest factor of `extent` no greater than `lanes`.
pub fn vectorize_factor(extent: u32, lanes: u32) -> u32 {
    factors(extent)
        .into_iter()
        .rev()
        .find(|&f| f <= lanes)
        .unwrap_or(1)
}

/// A power of two that divides `origin`, close to but below its square root.
///
/// Returns 1 when `origin` is at most 1 or odd.
pub fn split_even(origin: u32) -> u32 {
    if origin <= 1 {
        return 1;
    }
    let mut res = 1u32;
    while origin % res == 0 && u64::from(res) * u64::from(res) < u64::from(origin) {
        res *= 2;
    }
    (res / 2).max(1)
}

/// Picks the register-tile factor for an axis of extent `origin` from its power-of-two part.
///
/// That part is divided into two near-square factors. The larger is taken unless it would put
/// more than `thread_limit` iterations alongside `other_axis`.
pub fn inner_splitter(origin: u32, other_axis: u32, thread_limit: u32) -> u32 {
    if origin <= 1 {
        return 1;
    }
    let two_exp = 1u32 << origin.trailing_zeros();
    let a = split_even(two_exp);
    let b = two_exp / a;
    let (small, large) = if a < b { (a, b) } else { (b, a) };
    if u64::from(large) * u64::from(other_axis) > u64::from(thread_limit) {
        small
    } else {
        large
    }
}
