bitflags::bitflags! {
    /// Architecture-neutral mapping flags.
    ///
    /// These are what callers pass to [`Mapper::map`](crate::Mapper::map) and
    /// what [`Mapper::query`](crate::Mapper::query) reports back; the x86-64
    /// encoding lives in [`PageEntryBits`](crate::PageEntryBits).
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
    pub struct MapFlags: u32 {
        /// The translation is backed and valid.
        const PRESENT = 1 << 0;

        /// Writes are allowed.
        const WRITABLE = 1 << 1;

        /// Accessible from user mode; kernel-only otherwise.
        const USER = 1 << 2;

        /// Instruction fetches are allowed (NX clear).
        const EXECUTABLE = 1 << 3;

        /// 2 MiB leaf at the page-directory level.
        const HUGE = 1 << 4;

        /// Intentionally unbacked until first touched (demand paging).
        const ALLOCATE_ON_REFERENCE = 1 << 5;

        /// Read-only share; the first write forks a private frame.
        const COPY_ON_WRITE = 1 << 6;
    }
}

impl MapFlags {
    /// Kernel read/write data.
    pub const KERNEL_RW: Self = Self::PRESENT.union(Self::WRITABLE);

    /// User read/write data.
    pub const USER_RW: Self = Self::KERNEL_RW.union(Self::USER);

    /// Permission bits only, without the state bits a mapping moves through.
    #[must_use]
    pub const fn permissions(self) -> Self {
        self.intersection(Self::WRITABLE.union(Self::USER).union(Self::EXECUTABLE))
    }
}
