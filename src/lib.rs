//! `weft` is a lazy array engine. Building an expression only records a node in an op graph;
//! nothing runs until an array is read or evaluated.
//!
//! ## Key Components
//! 1. **Layouts**:
//!    - `Shape` describes an array as an offset, a view and signed strides over a flat buffer.
//!    - Broadcasting, slicing, permuting and contiguous reshaping are pure layout changes.
//!
//! 2. **Op Graph**:
//!    - Every operation validates its operands eagerly and returns a new `Array` node.
//!    - `Graph` executes pending nodes once each, in dependency order.
//!    - A partial reverse-mode pass accumulates gradients into the arrays it reaches.
//!
//! 3. **Backends**:
//!    - A `Backend` resolves kernels by name and runs them over a flat slot list.
//!    - Kernel names encode the op, operand layouts and element type; see [`kernel`].
//!    - A host backend and a WGSL compute backend are provided.

pub mod array;
pub mod autograd;
pub mod device;
pub mod dispatch;
pub mod graph;
pub mod kernel;
pub mod num;
pub mod ops;
pub mod shape;
pub mod slice;

pub use array::{Array, ArrayError, ArrayId};
pub use device::{Backend, BackendError, Cpu, CpuBuilder, Device, Gpu, GpuBuilder};
pub use graph::Graph;
pub use num::DataType;
pub use shape::{Shape, ShapeError};
pub use slice::{Axis, Range, Slice};
