use std::env;
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tpu_mem::bmdev::cmodel::Cmodel;
use tpu_mem::memory::{DeviceMem, allocator, transfer};
use tpu_mem::{Config, DeviceContext};

const HEAP_MASK: u32 = 0b111;

fn arg<T: std::str::FromStr>(args: &[String], idx: usize, default: T) -> T {
    args.get(idx).and_then(|s| s.parse().ok()).unwrap_or(default)
}

fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();
    let sleep_ms: u64 = arg(&args, 1, 100);
    let size: u64 = arg(&args, 2, 128);
    let dev_id: u32 = arg(&args, 3, 0);
    let loops: i64 = arg(&args, 4, -1);

    println!("Usage: {} [sleep_ms] [mem_size] [dev_id] [loop]", args[0]);
    println!("current config: sleep_ms={sleep_ms}, mem_size={size}, dev_id={dev_id}, loop={loops}");
    println!("================================================================");

    // 1. Open the device
    let config = Config::from_env();
    let opened = if env::var_os("TPU_MEM_CMODEL").is_some() {
        DeviceContext::simulated(dev_id, Arc::new(Cmodel::default()), config)
    } else {
        DeviceContext::open(dev_id, config)
    };
    let ctx = match opened {
        Ok(ctx) => ctx,
        Err(e) => {
            eprintln!("Open dev {dev_id} failed: {e}");
            return ExitCode::from(1);
        }
    };

    let Ok(len) = usize::try_from(size) else {
        eprintln!("mem_size {size} does not fit host memory");
        return ExitCode::from(1);
    };
    let input: Vec<u8> = (0..len).map(|i| (i + 1) as u8).collect();
    let mut output = vec![0u8; len];

    // 2. Allocate, round-trip, verify, free
    let started = Instant::now();
    let mut last: Option<(u64, Duration)> = None;
    let mut count: i64 = 0;
    while loops < 0 || count < loops {
        let mem: DeviceMem = match allocator::malloc_device_byte_heap_mask(&ctx, HEAP_MASK, size) {
            Ok(mem) => mem,
            Err(e) => {
                println!("alloc mem size={size} failed: {e}");
                return ExitCode::from(2);
            }
        };
        let addr = mem.device_addr();

        if let Err(e) = transfer::memcpy_s2d(&ctx, &mem, &input) {
            println!("s2d addr=0x{addr:x}, size={size} failed: {e}");
            return ExitCode::from(3);
        }

        output.fill(0);
        if let Err(e) = transfer::memcpy_d2s(&ctx, &mut output, &mem) {
            println!("d2s addr=0x{addr:x}, size={size} failed: {e}");
            return ExitCode::from(4);
        }

        if let Some(i) = (0..len).find(|&i| output[i] != input[i]) {
            println!("data {i} check failed! exp: {}, got {}", input[i], output[i]);
            for (i, (exp, got)) in input.iter().zip(&output).enumerate() {
                println!("data {i}: exp: {exp}, got {got}");
            }
            let fail_at = started.elapsed();
            println!("fail_addr: 0x{addr:x}, fail_time: {fail_at:?}");
            if let Some((last_addr, last_at)) = last {
                println!("last_addr: 0x{last_addr:x}, last_time: {last_at:?}");
                println!("time_elapsed: {}us", (fail_at - last_at).as_micros());
            }
            return ExitCode::from(5);
        }
        last = Some((addr, started.elapsed()));

        if let Err(e) = allocator::free_device(&ctx, &mem) {
            println!("free addr=0x{addr:x} failed: {e}");
        }

        count += 1;
        if count % 100 == 0 {
            println!("test_count:{count}, addr: 0x{addr:x}, time: {:?}", started.elapsed());
        }
        if sleep_ms > 0 {
            thread::sleep(Duration::from_millis(sleep_ms));
        }
    }

    ExitCode::SUCCESS
}
