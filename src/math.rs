use nalgebra as na;
use num_traits::Float;

/// Ordinary least squares fit of `y = a * x + b`, returns `[a, b]`.
pub fn linear_ls<T: na::RealField + Float>(x: &[T], y: &[T]) -> Option<na::Matrix2x1<T>> {
    if x.len() != y.len() || x.is_empty() {
        return None;
    }

    let x = na::DVector::from_column_slice(x);
    let y = na::DVector::from_column_slice(y);
    let n = T::from(x.len())?;
    let eps = T::from(f32::EPSILON)?;

    let s_x = x.sum();
    let s_x2 = x.map(|x| x * x).sum() + eps;
    let s_xy = x.zip_map(&y, |x, y| x * y).sum();
    let s_y = y.sum();

    let a = na::Matrix2::new(s_x2, s_x, s_x, n);
    let b = na::Matrix2x1::new(s_xy, s_y);

    let qr_result = a.qr();
    let qty = qr_result.q().transpose() * b;
    let beta_hat = qr_result.r().solve_upper_triangular(&qty)?;

    if beta_hat.iter().all(|v| Float::is_finite(*v)) {
        Some(beta_hat)
    } else {
        None
    }
}

pub fn gauss(x: f32, c: f32) -> f32 {
    (-((x * x) / (2.0 * c * c))).exp()
}

#[inline]
pub fn distance(a: na::Point2<f32>, b: na::Point2<f32>) -> f32 {
    na::distance(&a, &b)
}

pub fn median(values: &mut [f32]) -> Option<f32> {
    if values.is_empty() {
        return None;
    }

    values.sort_by(|a, b| a.total_cmp(b));
    Some(values[values.len() / 2])
}
