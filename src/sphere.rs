use std::f64::consts::PI;

/// map 2 variables u1 and u2 on the interval [0,1] to a point on the unit sphere
fn sample_unit_sphere(u1: f64, u2: f64) -> [f64; 3] {
    let theta = 2.0 * PI * u1;
    let phi = (1.0 - 2.0 * u2).clamp(-1., 1.).acos();
    let sin_phi = phi.sin();
    [sin_phi * theta.cos(), sin_phi * theta.sin(), phi.cos()]
}

/// Nearly uniform directions on the sphere from a Fibonacci lattice
pub fn fibonacci_sphere(n: usize) -> Vec<[f64; 3]> {
    let golden = (1. + 5f64.sqrt()) / 2.;
    (0..n)
        .map(|i| {
            let u1 = (i as f64 / golden).fract();
            let u2 = (i as f64 + 0.5) / n as f64;
            sample_unit_sphere(u1, u2)
        })
        .collect()
}

/// `n` evenly spaced directions on the great circle perpendicular to `axis`
pub fn perpendicular_circle(axis: &[f64; 3], n: usize) -> Vec<[f64; 3]> {
    let norm = dot(axis, axis).sqrt();
    let e1 = axis.map(|x| x / norm);

    // any vector not parallel to e1
    let temp = if e1[0].abs() < 0.9 { [1., 0., 0.] } else { [0., 1., 0.] };
    let e2 = normalize(&cross(&e1, &temp));
    let e3 = cross(&e1, &e2);

    (0..n)
        .map(|i| {
            let t = 2. * PI * i as f64 / n as f64;
            let (s, c) = t.sin_cos();
            [c * e2[0] + s * e3[0], c * e2[1] + s * e3[1], c * e2[2] + s * e3[2]]
        })
        .collect()
}

pub(crate) fn dot(a: &[f64; 3], b: &[f64; 3]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

fn cross(a: &[f64; 3], b: &[f64; 3]) -> [f64; 3] {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

fn normalize(v: &[f64; 3]) -> [f64; 3] {
    let n = dot(v, v).sqrt();
    v.map(|x| x / n)
}
