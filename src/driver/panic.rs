/// Logs the panic and parks the processor with interrupts off. The embedding
/// module calls this from its `#[panic_handler]`.
pub fn panic_impl(info: &core::panic::PanicInfo<'_>) -> ! {
    log::error!("vmmon panic: {info}");
    // Safety: nothing runs on this processor after a panic.
    unsafe { x86::irq::disable() };
    loop {
        unsafe { x86::halt() };
    }
}
