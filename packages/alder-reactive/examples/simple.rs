use alder_reactive::*;

fn main() {
    let data = create_signal(0);
    let doubled = create_memo(move || data.get() * 2);
    create_effect(on((data, doubled), move || {
        println!(
            "data value changed. new value = {}, doubled value = {}",
            data.get_untracked(),
            doubled.get_untracked()
        )
    }));
    data.set(1);
    data.set(2);
    data.set(3);
    data.set(4);
}
