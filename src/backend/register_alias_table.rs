use crate::instructions::instructions::{ARCH_REG_CNT, RegisterType};

/// The Register Alias Table. This structure is used for the register
/// renaming process. The RAT entry for a given architectural register
/// points to the physical register holding its most recent value.
/// Initially every architectural register maps to itself.
pub(crate) struct RAT {
    pub(crate) table: Vec<RegisterType>,
}

impl RAT {
    pub fn new() -> Self {
        let table = (0..ARCH_REG_CNT).collect();
        Self { table }
    }

    pub fn get(&self, arch_reg: RegisterType) -> RegisterType {
        match self.table.get(arch_reg as usize) {
            Some(phys_reg) => *phys_reg,
            None => panic!("RAT: architectural register {} doesn't exist", arch_reg),
        }
    }

    pub fn set(&mut self, arch_reg: RegisterType, phys_reg: RegisterType) {
        match self.table.get_mut(arch_reg as usize) {
            Some(entry) => *entry = phys_reg,
            None => panic!("RAT: architectural register {} doesn't exist", arch_reg),
        }
    }

    pub fn is_identity(&self) -> bool {
        self.table.iter().enumerate().all(|(arch_reg, phys_reg)| arch_reg == *phys_reg as usize)
    }

    pub fn flush(&mut self) {
        for (arch_reg, phys_reg) in self.table.iter_mut().enumerate() {
            *phys_reg = arch_reg as RegisterType;
        }
    }
}
