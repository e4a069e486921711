use num_enum::TryFromPrimitive;

/// Packet progression order from the COD marker's SGcod field.
///
/// The letters give the nesting of the packet loops, outermost first:
/// L layer, R resolution, C component, P precinct position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum ProgressionOrder {
    Lrcp = 0,
    Rlcp = 1,
    Rpcl = 2,
    Pcrl = 3,
    Cprl = 4,
}

impl ProgressionOrder {
    /// Whether resolution varies faster than component in packet order.
    pub fn resolution_inside_component(self) -> bool {
        matches!(self, Self::Cprl)
    }
}
