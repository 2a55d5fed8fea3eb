use crate::common::frame::Frame;
use crate::common::function::FunctionCode;
use crate::exception::ExceptionCode;
use crate::server::functions;
use crate::server::memory::Memory;

/// Implements the behavior of a single function code
///
/// A handler is invoked on the server's worker task with exclusive access to the memory banks.
/// `Ok` carries the data that follows the function code in the response; `Err` turns the response
/// into an exception. Returning [`ExceptionCode::IllegalFunction`] reports the function as
/// unsupported.
///
/// Closures with the signature `FnMut(&mut Memory, &dyn Frame) -> Result<Vec<u8>, ExceptionCode>`
/// implement this trait.
pub trait FunctionHandler: Send + 'static {
    /// process a request addressed to this server
    fn handle(&mut self, memory: &mut Memory, frame: &dyn Frame) -> Result<Vec<u8>, ExceptionCode>;
}

impl<F> FunctionHandler for F
where
    F: FnMut(&mut Memory, &dyn Frame) -> Result<Vec<u8>, ExceptionCode> + Send + 'static,
{
    fn handle(&mut self, memory: &mut Memory, frame: &dyn Frame) -> Result<Vec<u8>, ExceptionCode> {
        self(memory, frame)
    }
}

/// One slot per function code, indexed by the raw code
pub(crate) struct DispatchTable {
    handlers: [Option<Box<dyn FunctionHandler>>; 256],
}

impl DispatchTable {
    pub(crate) fn empty() -> Self {
        Self {
            handlers: std::array::from_fn(|_| None),
        }
    }

    /// table populated with the eight standard functions
    pub(crate) fn with_defaults() -> Self {
        let mut table = Self::empty();
        for code in FunctionCode::ALL {
            table.register(code.get_value(), default_handler(code));
        }
        table
    }

    /// install `handler`, silently replacing whatever occupied the slot
    pub(crate) fn register(&mut self, code: u8, handler: Box<dyn FunctionHandler>) {
        self.handlers[code as usize] = Some(handler);
    }

    pub(crate) fn unregister(&mut self, code: u8) {
        self.handlers[code as usize] = None;
    }

    pub(crate) fn get_mut(&mut self, code: u8) -> Option<&mut Box<dyn FunctionHandler>> {
        self.handlers[code as usize].as_mut()
    }
}

fn default_handler(code: FunctionCode) -> Box<dyn FunctionHandler> {
    match code {
        FunctionCode::ReadCoils => Box::new(functions::read_coils),
        FunctionCode::ReadDiscreteInputs => Box::new(functions::read_discrete_inputs),
        FunctionCode::ReadHoldingRegisters => Box::new(functions::read_holding_registers),
        FunctionCode::ReadInputRegisters => Box::new(functions::read_input_registers),
        FunctionCode::WriteSingleCoil => Box::new(functions::write_single_coil),
        FunctionCode::WriteSingleRegister => Box::new(functions::write_single_register),
        FunctionCode::WriteMultipleCoils => Box::new(functions::write_multiple_coils),
        FunctionCode::WriteMultipleRegisters => Box::new(functions::write_multiple_registers),
    }
}

#[cfg(test)]
mod tests {
    use crate::tcp::TcpFrame;
    use crate::types::UnitId;

    use super::*;

    fn boxed<F>(handler: F) -> Box<dyn FunctionHandler>
    where
        F: FnMut(&mut Memory, &dyn Frame) -> Result<Vec<u8>, ExceptionCode> + Send + 'static,
    {
        Box::new(handler)
    }

    fn call(
        table: &mut DispatchTable,
        memory: &mut Memory,
        frame: &TcpFrame,
    ) -> Option<Result<Vec<u8>, ExceptionCode>> {
        table
            .get_mut(frame.function())
            .map(|handler| handler.handle(memory, frame))
    }

    #[test]
    fn defaults_cover_standard_functions_only() {
        let mut table = DispatchTable::with_defaults();
        for code in FunctionCode::ALL {
            assert!(table.get_mut(code.get_value()).is_some());
        }
        assert!(table.get_mut(0x55).is_none());
        assert!(table.get_mut(0x00).is_none());
    }

    #[test]
    fn register_replaces_existing_slot() {
        let mut table = DispatchTable::with_defaults();
        let mut memory = Memory::default();
        table.register(0x01, boxed(|_, _| Ok(vec![0x01, 0xAA])));
        let frame = TcpFrame::new(1, UnitId::new(1), 0x01, &[0x00, 0x00, 0x00, 0x08]);
        assert_eq!(call(&mut table, &mut memory, &frame), Some(Ok(vec![0x01, 0xAA])));
    }

    #[test]
    fn unregister_empties_slot() {
        let mut table = DispatchTable::with_defaults();
        table.unregister(0x03);
        assert!(table.get_mut(0x03).is_none());
    }

    #[test]
    fn stateful_closures_keep_their_state() {
        let mut table = DispatchTable::empty();
        let mut memory = Memory::default();
        let mut calls: u8 = 0;
        table.register(
            0x41,
            Box::new(move |_: &mut Memory, _: &dyn Frame| -> Result<Vec<u8>, ExceptionCode> {
                calls += 1;
                Ok(vec![calls])
            }),
        );
        let frame = TcpFrame::new(1, UnitId::new(1), 0x41, &[]);
        assert_eq!(call(&mut table, &mut memory, &frame), Some(Ok(vec![1])));
        assert_eq!(call(&mut table, &mut memory, &frame), Some(Ok(vec![2])));
    }
}
