/// Number of addresses in each table
pub const TABLE_SIZE: usize = u16::MAX as usize + 1;

/// The four data tables exposed by the server, each spanning the full 16-bit address space
///
/// The memory is owned by the task that dispatches requests. Handlers, observers and
/// [`Server::with_memory`](crate::server::Server::with_memory) closures all run on that task,
/// one at a time, so no request ever observes another request's partial writes.
pub struct Memory {
    discrete_inputs: Box<[bool]>,
    coils: Box<[bool]>,
    holding_registers: Box<[u16]>,
    input_registers: Box<[u16]>,
}

impl Memory {
    pub(crate) fn new() -> Self {
        Self {
            discrete_inputs: vec![false; TABLE_SIZE].into_boxed_slice(),
            coils: vec![false; TABLE_SIZE].into_boxed_slice(),
            holding_registers: vec![0; TABLE_SIZE].into_boxed_slice(),
            input_registers: vec![0; TABLE_SIZE].into_boxed_slice(),
        }
    }

    /// Read-only bits
    pub fn discrete_inputs(&self) -> &[bool] {
        &self.discrete_inputs
    }

    /// Mutable access to the discrete inputs, for the owning process or custom handlers
    pub fn discrete_inputs_mut(&mut self) -> &mut [bool] {
        &mut self.discrete_inputs
    }

    /// Read/write bits
    pub fn coils(&self) -> &[bool] {
        &self.coils
    }

    /// Mutable access to the coils
    pub fn coils_mut(&mut self) -> &mut [bool] {
        &mut self.coils
    }

    /// Read/write 16-bit registers
    pub fn holding_registers(&self) -> &[u16] {
        &self.holding_registers
    }

    /// Mutable access to the holding registers
    pub fn holding_registers_mut(&mut self) -> &mut [u16] {
        &mut self.holding_registers
    }

    /// Read-only 16-bit registers
    pub fn input_registers(&self) -> &[u16] {
        &self.input_registers
    }

    /// Mutable access to the input registers, for the owning process or custom handlers
    pub fn input_registers_mut(&mut self) -> &mut [u16] {
        &mut self.input_registers
    }
}

impl std::fmt::Debug for Memory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Memory").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_table_spans_the_address_space() {
        let mut memory = Memory::new();
        assert_eq!(memory.discrete_inputs().len(), TABLE_SIZE);
        assert_eq!(memory.coils().len(), TABLE_SIZE);
        assert_eq!(memory.holding_registers().len(), TABLE_SIZE);
        assert_eq!(memory.input_registers().len(), TABLE_SIZE);

        memory.holding_registers_mut()[0xFFFF] = 0xCAFE;
        assert_eq!(memory.holding_registers()[65535], 0xCAFE);
        assert_eq!(memory.input_registers()[65535], 0);
    }
}
