/*!
 * Monitoring
 * Structured tracing setup and operation spans
 */

mod tracer;

pub use tracer::{init_tracing, span_operation, OperationSpan};
