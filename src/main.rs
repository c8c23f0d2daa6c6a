use jit_memory_manager::{
    create_default_manager, DefaultMemoryManager, FrameRegister, JitMemoryManager,
    MemoryManagerOptions,
};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[cfg(target_arch = "x86_64")]
const RETURN_42: &[u8] = &[0xB8, 0x2A, 0x00, 0x00, 0x00, 0xC3]; // mov eax, 42; ret
#[cfg(target_arch = "aarch64")]
const RETURN_42: &[u8] = &[0x40, 0x05, 0x80, 0x52, 0xC0, 0x03, 0x5F, 0xD6]; // mov w0, #42; ret
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
const RETURN_42: &[u8] = &[];

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();

    let mm = DefaultMemoryManager::<&str>::with_options(MemoryManagerOptions {
        poison_memory: true,
        ..Default::default()
    });

    let options = mm.options();
    println!(
        "body capacity {} bytes, stub area {} bytes, {} GOT entries",
        options.function_body_size, options.stub_area_size, options.got_entries
    );

    mm.allocate_got().unwrap();
    println!("GOT at {:p}", mm.got_base().unwrap());

    for round in 0..3 {
        let mut size = 0;
        let start = mm.start_function_body(&"answer", &mut size).unwrap();
        let stub = mm.allocate_stub(&"callee", 16, 16).unwrap();

        println!("round {round}: body at {start:p} ({size} bytes), stub at {stub:p}");

        let end = unsafe {
            core::ptr::copy_nonoverlapping(RETURN_42.as_ptr(), start, RETURN_42.len());
            start.add(RETURN_42.len())
        };
        mm.end_function_body(&"answer", start, end).unwrap();

        let mut table_size = 64;
        let table = mm.start_exception_table(&"answer", &mut table_size).unwrap();
        mm.end_exception_table(&"answer", table, unsafe { table.add(16) }, FrameRegister(6))
            .unwrap();

        mm.set_memory_executable().unwrap();

        if !RETURN_42.is_empty() {
            let f: extern "C" fn() -> i32 = unsafe { core::mem::transmute(start) };
            println!("round {round}: function returned {}", f());
        }

        mm.set_memory_writable().unwrap();
        mm.deallocate_mem_for_function(&"answer").unwrap();

        println!("round {round}: code {:?}", mm.code_statistics());
    }

    println!("data {:?}", mm.data_statistics());

    let boxed = create_default_manager::<u64, u64>();
    let mut size = 0;
    let start = boxed.start_function_body(&1, &mut size).unwrap();
    boxed.end_function_body(&1, start, start).unwrap();
    boxed.deallocate_mem_for_function(&1).unwrap();
    println!("boxed manager needs exact size: {}", boxed.needs_exact_size());
}
