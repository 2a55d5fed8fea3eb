use crate::constants::DEFAULT_BANK_CAPACITY;
use crate::exception::ExceptionCode;
use crate::types::AddressRange;

/// Number of cells allocated for each of the four memory banks
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct BankCapacity {
    /// number of discrete inputs
    pub discrete_inputs: usize,
    /// number of coils
    pub coils: usize,
    /// number of holding registers
    pub holding_registers: usize,
    /// number of input registers
    pub input_registers: usize,
}

impl BankCapacity {
    /// Use the same capacity for every bank
    pub const fn uniform(capacity: usize) -> Self {
        Self {
            discrete_inputs: capacity,
            coils: capacity,
            holding_registers: capacity,
            input_registers: capacity,
        }
    }
}

/// Every bank covers the whole 16-bit address space
impl Default for BankCapacity {
    fn default() -> Self {
        Self::uniform(DEFAULT_BANK_CAPACITY)
    }
}

/// The process image shared by every connection to a server
///
/// Banks are allocated once and never resized. The worker task is the only owner; handlers and
/// [`crate::Server::memory`] closures receive it by mutable reference for the duration of a call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Memory {
    /// read-only bits
    pub discrete_inputs: Box<[bool]>,
    /// read-write bits
    pub coils: Box<[bool]>,
    /// read-write 16-bit words
    pub holding_registers: Box<[u16]>,
    /// read-only 16-bit words
    pub input_registers: Box<[u16]>,
}

impl Memory {
    /// Allocate zeroed banks with the requested capacities
    pub fn new(capacity: BankCapacity) -> Self {
        Self {
            discrete_inputs: vec![false; capacity.discrete_inputs].into_boxed_slice(),
            coils: vec![false; capacity.coils].into_boxed_slice(),
            holding_registers: vec![0; capacity.holding_registers].into_boxed_slice(),
            input_registers: vec![0; capacity.input_registers].into_boxed_slice(),
        }
    }

    /// Current capacities of the banks
    pub fn capacity(&self) -> BankCapacity {
        BankCapacity {
            discrete_inputs: self.discrete_inputs.len(),
            coils: self.coils.len(),
            holding_registers: self.holding_registers.len(),
            input_registers: self.input_registers.len(),
        }
    }
}

impl Default for Memory {
    fn default() -> Self {
        Self::new(BankCapacity::default())
    }
}

/// cells of a bank covered by `range`, or `IllegalDataAddress` if it extends past the end
pub(crate) fn cells<T>(bank: &[T], range: AddressRange) -> Result<&[T], ExceptionCode> {
    bank.get(range.to_std_range())
        .ok_or(ExceptionCode::IllegalDataAddress)
}

pub(crate) fn cells_mut<T>(bank: &mut [T], range: AddressRange) -> Result<&mut [T], ExceptionCode> {
    bank.get_mut(range.to_std_range())
        .ok_or(ExceptionCode::IllegalDataAddress)
}

pub(crate) fn cell_mut<T>(bank: &mut [T], index: u16) -> Result<&mut T, ExceptionCode> {
    bank.get_mut(index as usize)
        .ok_or(ExceptionCode::IllegalDataAddress)
}
