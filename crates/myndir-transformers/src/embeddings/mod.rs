//! Token and learned-position embedding tables.

use anyhow::{Result, bail};
use ndarray::{Array2, Array3, Axis, s};
use std::ops::AddAssign;


/// A CPU embedding layer: word lookup plus an optional learned position table.
#[derive(Debug, Clone)]
pub struct Embeddings {
    pub word_embeddings: Array2<f32>,
    pub position_embeddings: Option<Array2<f32>>,
}

impl Embeddings {
    pub fn new(word_embeddings: Array2<f32>, position_embeddings: Option<Array2<f32>>) -> Result<Self> {
        if let Some(pos) = &position_embeddings {
            if pos.shape()[1] != word_embeddings.shape()[1] {
                bail!(
                    "position table width {} doesn't match word table width {}",
                    pos.shape()[1],
                    word_embeddings.shape()[1]
                );
            }
        }
        Ok(Self {
            word_embeddings,
            position_embeddings,
        })
    }

    pub fn vocab_size(&self) -> usize {
        self.word_embeddings.shape()[0]
    }

    pub fn hidden_size(&self) -> usize {
        self.word_embeddings.shape()[1]
    }

    pub fn max_positions(&self) -> Option<usize> {
        self.position_embeddings.as_ref().map(|p| p.shape()[0])
    }

    /// Embeds `input_ids` (`[batch, seq]`) whose first token sits at
    /// `position_offset`. Returns `[batch, seq, hidden]`.
    pub fn forward(&self, input_ids: &Array2<u32>, position_offset: usize) -> Result<Array3<f32>> {
        let (batch_size, seq_len) = input_ids.dim();
        let hidden_size = self.hidden_size();

        let mut hidden = Array3::<f32>::zeros((batch_size, seq_len, hidden_size));
        self.perform_word_lookup(&mut hidden, input_ids)?;

        if let Some(ref pos_emb) = self.position_embeddings {
            let end_idx = position_offset + seq_len;
            let max_position = pos_emb.shape()[0];
            if end_idx > max_position {
                bail!(
                    "positions {}..{} exceed the position table ({} rows)",
                    position_offset,
                    end_idx,
                    max_position
                );
            }

            // [seq, hidden] -> [1, seq, hidden]
            let pos_broadcast = pos_emb
                .slice(s![position_offset..end_idx, ..])
                .insert_axis(Axis(0));
            hidden.add_assign(&pos_broadcast);
        }

        Ok(hidden)
    }

    fn perform_word_lookup(&self, hidden: &mut Array3<f32>, input_ids: &Array2<u32>) -> Result<()> {
        let vocab_size = self.vocab_size();
        for ((b, t), &id) in input_ids.indexed_iter() {
            let id = id as usize;
            if id >= vocab_size {
                bail!("token id {} out of range for vocab size {}", id, vocab_size);
            }
            hidden
                .slice_mut(s![b, t, ..])
                .assign(&self.word_embeddings.row(id));
        }
        Ok(())
    }
}
