use std::sync::Arc;

use crate::constants::function;
use crate::exception::ExceptionCode;
use crate::frame::Frame;
use crate::server::builtin;
use crate::server::memory::Memory;

/// Handler invoked for one function code
///
/// `Ok(payload)` becomes the response payload, `Err(code)` an exception response. The handler
/// runs on the task that owns the memory, so it must not block.
pub type FunctionHandler =
    Arc<dyn Fn(&mut Memory, &Frame) -> Result<Vec<u8>, ExceptionCode> + Send + Sync>;

/// Callback invoked with the request after every handled request, before the response is written
pub type Observer = Arc<dyn Fn(&Memory, &Frame) + Send + Sync>;

/// Handlers indexed by the raw function code
pub(crate) struct FunctionTable {
    handlers: [Option<FunctionHandler>; 256],
}

impl FunctionTable {
    pub(crate) fn empty() -> Self {
        Self {
            handlers: std::array::from_fn(|_| None),
        }
    }

    pub(crate) fn with_builtins() -> Self {
        let mut table = Self::empty();
        table.register(function::READ_COILS, Arc::new(builtin::read_coils));
        table.register(
            function::READ_DISCRETE_INPUTS,
            Arc::new(builtin::read_discrete_inputs),
        );
        table.register(
            function::READ_HOLDING_REGISTERS,
            Arc::new(builtin::read_holding_registers),
        );
        table.register(
            function::READ_INPUT_REGISTERS,
            Arc::new(builtin::read_input_registers),
        );
        table.register(function::WRITE_SINGLE_COIL, Arc::new(builtin::write_single_coil));
        table.register(
            function::WRITE_SINGLE_REGISTER,
            Arc::new(builtin::write_single_register),
        );
        table.register(
            function::WRITE_MULTIPLE_COILS,
            Arc::new(builtin::write_multiple_coils),
        );
        table.register(
            function::WRITE_MULTIPLE_REGISTERS,
            Arc::new(builtin::write_multiple_registers),
        );
        table
    }

    /// replaces any existing handler
    pub(crate) fn register(&mut self, code: u8, handler: FunctionHandler) {
        self.handlers[code as usize] = Some(handler);
    }

    pub(crate) fn get(&self, code: u8) -> Option<FunctionHandler> {
        self.handlers[code as usize].clone()
    }
}
