/// Read-only view of one intercepted outbound packet.
#[derive(Debug, Clone, Copy)]
pub struct PacketView<'a> {
    // Network-layer bytes as handed over by the hook (IP header first)
    pub payload: &'a [u8],

    // Execution context that delivered the packet (NFQUEUE number, worker index)
    pub context: usize,
}

impl<'a> PacketView<'a> {
    pub fn new(payload: &'a [u8], context: usize) -> Self {
        Self { payload, context }
    }
}
