fn main() {
    screenwatch_lib::run();
}
