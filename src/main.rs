fn main() -> anyhow::Result<()> {
    spm::sv::main()
}
