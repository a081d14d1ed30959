//! Linear algebra operations for transformers

use ndarray::{Array2, Array3, Array4, ArrayView2, Zip};

/// Performs matmul for 2D inputs. Weights are in `[In, Out]` layout.
#[inline]
pub fn matmul_2d(a: &ArrayView2<f32>, b: &ArrayView2<f32>) -> Array2<f32> {
    let (_, k) = a.dim();
    let (k2, _) = b.dim();
    assert_eq!(k, k2, "Matmul inner dimensions do not match");
    a.dot(b)
}

/// Performs matmul for a 3D input and a 2D weight matrix in `[In, Out]` layout.
#[inline]
pub fn matmul_3d_2d(a: &Array3<f32>, b: &ArrayView2<f32>) -> Array3<f32> {
    let (batch, m, k) = a.dim();
    let (k2, n) = b.dim();
    assert_eq!(k, k2, "Matmul inner dimensions do not match");
    let a_std = a.as_standard_layout();
    let a_flat = a_std.view().into_shape_with_order((batch * m, k)).unwrap();
    let c_flat = matmul_2d(&a_flat, b);
    c_flat.into_shape_with_order((batch, m, n)).unwrap()
}

/// Batched matmul over the leading `[batch, heads]` axes.
///
/// `a` is `[batch, heads, m, k]`, `b` is `[batch, heads, k, n]`.
#[inline]
pub fn matmul_4d(a: &Array4<f32>, b: &Array4<f32>) -> Array4<f32> {
    let (batch, heads, m, k) = a.dim();
    let (b_batch, b_heads, k2, n) = b.dim();
    assert_eq!((batch, heads), (b_batch, b_heads), "Batched matmul leading axes do not match");
    assert_eq!(k, k2, "Matmul inner dimensions do not match");

    let mut output = Array4::<f32>::zeros((batch, heads, m, n));

    Zip::from(output.outer_iter_mut())
        .and(a.outer_iter())
        .and(b.outer_iter())
        .par_for_each(|mut out_b, a_b, b_b| {
            Zip::from(out_b.outer_iter_mut())
                .and(a_b.outer_iter())
                .and(b_b.outer_iter())
                .for_each(|mut out_h, a_h, b_h| {
                    out_h.assign(&a_h.dot(&b_h));
                });
        });

    output
}
