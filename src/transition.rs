//! Recurrent transition maintaining the inference cell's memory.

use burn::module::{Module, Param};
use burn::nn::{Linear, LinearConfig};
use burn::tensor::activation;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

/// LSTM transition with a trainable initial state.
///
/// The input map carries the bias; the recurrent map has none. Gate order in
/// the fused projection is `[candidate, input, forget, output]`, and the
/// forget gate logits get a constant offset of one.
#[derive(Module, Debug)]
pub struct LstmTransition<B: Backend> {
    input_size: usize,
    hidden_size: usize,
    input_map: Linear<B>,
    recurrent_map: Linear<B>,
    initial_hidden: Param<Tensor<B, 2>>,
    initial_cell: Param<Tensor<B, 2>>,
}

impl<B: Backend> LstmTransition<B> {
    /// Creates a transition mapping `input_size` features to a
    /// `hidden_size` state.
    pub fn new(input_size: usize, hidden_size: usize, device: &B::Device) -> Self {
        Self {
            input_size,
            hidden_size,
            input_map: LinearConfig::new(input_size, 4 * hidden_size).init(device),
            recurrent_map: LinearConfig::new(hidden_size, 4 * hidden_size)
                .with_bias(false)
                .init(device),
            initial_hidden: Param::from_tensor(Tensor::zeros([1, hidden_size], device)),
            initial_cell: Param::from_tensor(Tensor::zeros([1, hidden_size], device)),
        }
    }

    /// Input feature width.
    pub fn input_size(&self) -> usize {
        self.input_size
    }

    /// Hidden state width.
    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    /// Initial `(hidden, cell)` state broadcast over the batch, each
    /// `[batch_size, hidden_size]`. Gradients reach the stored parameters.
    pub fn init_state(&self, batch_size: usize) -> (Tensor<B, 2>, Tensor<B, 2>) {
        (
            self.initial_hidden
                .val()
                .expand([batch_size, self.hidden_size]),
            self.initial_cell
                .val()
                .expand([batch_size, self.hidden_size]),
        )
    }

    /// Advances the state by one step.
    ///
    /// `input` is `[batch, input_size]`; returns the new
    /// `(hidden, cell)` state.
    pub fn forward(
        &self,
        input: Tensor<B, 2>,
        state: (Tensor<B, 2>, Tensor<B, 2>),
    ) -> (Tensor<B, 2>, Tensor<B, 2>) {
        let (hidden, cell) = state;

        let z = self.input_map.forward(input) + self.recurrent_map.forward(hidden);
        let gates = z.chunk(4, 1);
        let candidate = gates[0].clone().tanh();
        let input_gate = activation::sigmoid(gates[1].clone());
        // Add 1.0 bias to forget gate
        let forget_gate = activation::sigmoid(gates[2].clone() + 1.0);
        let output_gate = activation::sigmoid(gates[3].clone());

        let cell = cell * forget_gate + candidate * input_gate;
        let hidden = cell.clone().tanh() * output_gate;
        (hidden, cell)
    }
}
