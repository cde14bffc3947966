pub mod gdt;
pub mod idt;

pub use idt::{set_irq_masks, IRQ_MASK_NONE, IRQ_MASK_OPEN};

pub fn init() {
    gdt::init();
    idt::init();
    unsafe { idt::PICS.lock().initialize() };
}
