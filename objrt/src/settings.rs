use crate::{ALIGNMENT, HEADER_SIZE, MAX_ARENA_SIZE, MainBuffer, is_aligned};

/// Smallest interface map that still fits the bootstrap types.
pub const MIN_INTERFACE_MAP_SLOTS: usize = 16;

/// Pattern written over fresh arena memory in debug builds.
pub const DEBUG_FILL: u8 = 0xA5;

// TODO: expose a growth policy once the arena can chain a second buffer
#[derive(Debug, Default)]
pub struct RuntimeCreateInfo {
    /// arena size in bytes, ignored when `main_buffer` is given
    pub arena_size: usize,
    /// host owned arena memory, mapped by the runtime when absent
    pub main_buffer: Option<MainBuffer>,
    pub interface_map_slots: Option<usize>,
    /// expected number of registered types
    pub initial_type_capacity: Option<usize>,
    pub interior_offset: Option<usize>,
    pub retry_interior: Option<bool>,
    pub debug_fill: Option<Option<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeSettings {
    pub arena_size: usize,
    pub interface_map_slots: usize,
    pub initial_type_capacity: usize,
    pub interior_offset: usize,
    pub retry_interior: bool,
    pub debug_fill: Option<u8>,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            arena_size: 1024 * 1024,
            interface_map_slots: 4096,
            initial_type_capacity: 64,
            interior_offset: HEADER_SIZE,
            retry_interior: true,
            debug_fill: cfg!(debug_assertions).then_some(DEBUG_FILL),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SettingsError {
    #[error("arena size must be at least {min} bytes, got {0}", min = ALIGNMENT)]
    ArenaTooSmall(usize),
    #[error("arena size {0} exceeds the maximum of {max} bytes", max = MAX_ARENA_SIZE)]
    ArenaTooLarge(usize),
    #[error("main buffer at {0:#x} is not {align}-byte aligned", align = ALIGNMENT)]
    MisalignedBuffer(usize),
    #[error("interface map needs at least {min} slots, got {0}", min = MIN_INTERFACE_MAP_SLOTS)]
    InterfaceMapTooSmall(usize),
    #[error("interior offset {0} is not a multiple of {align}", align = ALIGNMENT)]
    MisalignedInteriorOffset(usize),
    #[error("failed to map {0} bytes for the arena")]
    MapFailed(usize),
}

impl RuntimeSettings {
    /// Applies the overrides of `info` on top of the defaults.
    pub fn from_create_info(info: &RuntimeCreateInfo) -> Self {
        let mut settings = Self {
            arena_size: info
                .main_buffer
                .as_ref()
                .map_or(info.arena_size, MainBuffer::len),
            ..Self::default()
        };
        info.interface_map_slots
            .inspect(|&slots| settings.interface_map_slots = slots);
        info.initial_type_capacity
            .inspect(|&capacity| settings.initial_type_capacity = capacity);
        info.interior_offset
            .inspect(|&offset| settings.interior_offset = offset);
        info.retry_interior
            .inspect(|&retry| settings.retry_interior = retry);
        info.debug_fill.inspect(|&fill| settings.debug_fill = fill);
        settings
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.arena_size < ALIGNMENT {
            return Err(SettingsError::ArenaTooSmall(self.arena_size));
        }
        if self.arena_size > MAX_ARENA_SIZE {
            return Err(SettingsError::ArenaTooLarge(self.arena_size));
        }
        if self.interface_map_slots < MIN_INTERFACE_MAP_SLOTS {
            return Err(SettingsError::InterfaceMapTooSmall(self.interface_map_slots));
        }
        if !is_aligned(self.interior_offset) {
            return Err(SettingsError::MisalignedInteriorOffset(self.interior_offset));
        }
        Ok(())
    }
}
