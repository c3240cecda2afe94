use ndarray::{s, Array2, ArrayView2};

/// Fixed sinusoidal position table, precomputed up to `max_seq_len` positions.
///
/// For every even feature index `i`:
/// `pe[pos, i] = sin(pos / 10000^(2i / d_model))` and
/// `pe[pos, i + 1] = cos(pos / 10000^(2(i + 1) / d_model))`.
/// `d_model` must be even.
pub struct PositionEncoding {
    pub encoding: Array2<f32>,
}

impl PositionEncoding {
    pub fn new(max_seq_len: usize, d_model: usize) -> Self {
        let mut encoding = Array2::zeros((max_seq_len, d_model));
        let d = d_model as f64;

        for pos in 0..max_seq_len {
            let p = pos as f64;
            for i in (0..d_model).step_by(2) {
                encoding[[pos, i]] = (p / 10000f64.powf((2 * i) as f64 / d)).sin() as f32;
                if i + 1 < d_model {
                    encoding[[pos, i + 1]] =
                        (p / 10000f64.powf((2 * (i + 1)) as f64 / d)).cos() as f32;
                }
            }
        }

        Self { encoding }
    }

    pub fn max_seq_len(&self) -> usize {
        self.encoding.nrows()
    }

    pub fn get_encoding(&self, position: usize, dimension: usize) -> Option<f32> {
        self.encoding.get([position, dimension]).copied()
    }

    /// The first `seq_len` rows of the table. `seq_len` must not exceed `max_seq_len`.
    pub fn slice(&self, seq_len: usize) -> ArrayView2<'_, f32> {
        self.encoding.slice(s![..seq_len, ..])
    }

    /// Add the encoding in place to `(seq_len, d_model)` embeddings.
    pub fn apply_to_input(&self, input: &mut Array2<f32>) {
        let seq_len = input.nrows().min(self.max_seq_len());
        let mut head = input.slice_mut(s![..seq_len, ..]);
        head += &self.slice(seq_len);
    }
}
