// SPDX-License-Identifier: Apache-2.0 OR MIT
fn main() {
    // `cargo tarpaulin` sets the `tarpaulin` cfg during coverage runs; declare
    // it so regular builds do not warn about an unexpected cfg name.
    println!("cargo:rustc-check-cfg=cfg(tarpaulin)");
}
