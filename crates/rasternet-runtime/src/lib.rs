//! GPU executor for compiled rasternet graphs.
//!
//! This crate runs the output of `rasternet-compiler` on a GPU through
//! `wgpu` render pipelines only: tensors live in `Rgba32Float` array
//! textures and every op is a full-screen draw into one or more output
//! layers.
//!
//! # Architecture
//!
//! 1. **GPU initialization** - `Runtime` selects an adapter and derives
//!    `HardwareLimits` from it
//! 2. **Texture management** - Allocate, pack/upload and read back tensor
//!    textures
//! 3. **Execution** - `Engine` walks `Uninitialized → Compiled → Ready →
//!    Running → Ready | Failed`, issuing one draw per planned layer batch
//!
//! # Example
//!
//! ```no_run
//! use rasternet_compiler::{CompileOptions, EngineOptions};
//! use rasternet_runtime::{Runtime, Tensor};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = Runtime::new().await?;
//!     let model = rasternet_model::load_model("model/model.json").await?;
//!
//!     let mut engine = runtime.engine(EngineOptions::default())?;
//!     engine.compile(&model, &CompileOptions::default())?;
//!
//!     let input = Tensor::from_vec(vec![1.0f32, 2.0, 3.0, 4.0], &[1, 2, 2, 1])?;
//!     let outputs = engine.run(&[("input", input)])?;
//!     for (name, tensor) in &outputs {
//!         println!("{name}: {}", tensor.to_nested()?);
//!     }
//!     Ok(())
//! }
//! ```

mod engine;
mod error;
mod runtime;
mod state;
mod tensor;
mod texture;

pub use engine::Engine;
pub use error::{Result, RuntimeError};
pub use runtime::{Runtime, hardware_limits};
pub use state::{EngineEvent, EngineState};
pub use tensor::{Element, Tensor};
