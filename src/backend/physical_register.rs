use crate::instructions::instructions::{ARCH_REG_CNT, RegisterType};

#[derive(Clone, Copy, PartialEq, Debug)]
pub(crate) struct PhysRegEntry {
    // the value has been produced (there are no values, only the fact that it is available).
    pub(crate) ready: bool,
    // nothing refers to this register; it can be handed out by rename.
    pub(crate) free: bool,
}

impl PhysRegEntry {
    fn reset(&mut self, arch: bool) {
        // The architectural registers are always ready and never free; the renaming registers start
        // out free and without a value.
        self.ready = arch;
        self.free = !arch;
    }
}

/// The physical register file. The first ARCH_REG_CNT entries are the architectural registers,
/// the remaining entries are the renaming targets.
pub(crate) struct PhysRegFile {
    pub(crate) count: u16,
    entries: Vec<PhysRegEntry>,
}

impl PhysRegFile {
    pub(crate) fn new(phys_reg_count: u16) -> PhysRegFile {
        let count = ARCH_REG_CNT + phys_reg_count;
        let mut entries = Vec::with_capacity(count as usize);
        for i in 0..count {
            let mut entry = PhysRegEntry { ready: false, free: false };
            entry.reset(i < ARCH_REG_CNT);
            entries.push(entry);
        }

        PhysRegFile { count, entries }
    }

    pub(crate) fn is_arch(reg: RegisterType) -> bool {
        reg < ARCH_REG_CNT
    }

    pub(crate) fn get(&self, reg: RegisterType) -> &PhysRegEntry {
        match self.entries.get(reg as usize) {
            Some(entry) => entry,
            None => panic!("phys register {} doesn't exist; count={}", reg, self.count),
        }
    }

    fn get_mut(&mut self, reg: RegisterType) -> &mut PhysRegEntry {
        let count = self.count;
        match self.entries.get_mut(reg as usize) {
            Some(entry) => entry,
            None => panic!("phys register {} doesn't exist; count={}", reg, count),
        }
    }

    pub(crate) fn is_ready(&self, reg: RegisterType) -> bool {
        self.get(reg).ready
    }

    // Returns the lowest numbered free renaming register, if any.
    fn find_free(&self) -> Option<RegisterType> {
        (ARCH_REG_CNT..self.count).find(|&reg| self.entries[reg as usize].free)
    }

    pub(crate) fn has_free(&self) -> bool {
        self.find_free().is_some()
    }

    pub(crate) fn free_cnt(&self) -> usize {
        self.entries.iter().filter(|entry| entry.free).count()
    }

    pub(crate) fn allocate(&mut self) -> RegisterType {
        if let Some(reg) = self.find_free() {
            let entry = &mut self.entries[reg as usize];
            entry.free = false;
            entry.ready = false;
            return reg;
        } else {
            panic!("No free PhysReg")
        }
    }

    // Called when the producing instruction completes. The register stays allocated.
    pub(crate) fn mark_ready(&mut self, reg: RegisterType) {
        let entry = self.get_mut(reg);
        debug_assert!(!entry.free, "phys register {} is marked ready while it is free", reg);
        entry.ready = true;
    }

    pub(crate) fn deallocate(&mut self, reg: RegisterType) {
        assert!(!Self::is_arch(reg), "architectural register {} can't be deallocated", reg);

        let entry = self.get_mut(reg);
        assert!(!entry.free, "phys register {} can't be deallocated while it is free", reg);

        entry.reset(false);
    }

    pub(crate) fn flush(&mut self) {
        for (i, entry) in self.entries.iter_mut().enumerate() {
            entry.reset(i < ARCH_REG_CNT as usize);
        }
    }
}
